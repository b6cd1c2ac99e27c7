use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;
use tokio::task::JoinSet;

use genflow::Error;
use genflow::accounts::{AccountPool, AccountPoolConfig, UnconfiguredCredentialProvider};
use genflow::database::repositories::SqlxAccountRepository;
use genflow::database::{init_pool_with_size, run_migrations};
use genflow::domain::{PipelineKind, Platform};

async fn file_pool(dir: &TempDir, connections: u32) -> Arc<AccountPool> {
    let db_path = dir.path().join("bindings.db");
    let db_url = format!(
        "sqlite:{}?mode=rwc",
        db_path.to_string_lossy().replace('\\', "/")
    );
    let pool = init_pool_with_size(&db_url, connections).await.unwrap();
    run_migrations(&pool).await.unwrap();
    Arc::new(AccountPool::new(
        Arc::new(SqlxAccountRepository::new(pool)),
        Arc::new(UnconfiguredCredentialProvider),
        AccountPoolConfig::default(),
    ))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_selection_never_binds_an_account_twice() {
    const ACCOUNTS: usize = 4;
    const TASKS: usize = 16;
    const ROUNDS: usize = 3;

    let dir = TempDir::new().unwrap();
    let accounts = file_pool(&dir, 16).await;
    let text: Vec<String> = (0..ACCOUNTS)
        .map(|i| format!("user{i}----pw----sid={i}"))
        .collect();
    let report = accounts
        .add_accounts(Platform::Jimeng, &text.join("\n"))
        .await
        .unwrap();
    assert_eq!(report.added.len(), ACCOUNTS);

    // account id -> task currently holding it
    let holders = Arc::new(DashMap::<String, String>::new());
    let bindings = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut tasks = JoinSet::new();
    for t in 0..TASKS {
        let accounts = accounts.clone();
        let holders = holders.clone();
        let bindings = bindings.clone();
        let peak = peak.clone();
        tasks.spawn(async move {
            let task_id = format!("task-{t}");
            let mut held = 0;
            while held < ROUNDS {
                let account = match accounts
                    .select_account(Platform::Jimeng, PipelineKind::Text2Img, &task_id)
                    .await
                {
                    Ok(account) => account,
                    Err(Error::NoEligibleAccount { .. }) => {
                        tokio::time::sleep(Duration::from_millis(1)).await;
                        continue;
                    }
                    Err(e) => panic!("selection failed: {e}"),
                };
                assert_eq!(account.bound_task_id.as_deref(), Some(task_id.as_str()));

                let previous = holders.insert(account.id.clone(), task_id.clone());
                assert!(
                    previous.is_none(),
                    "account {} bound to {} while held by {:?}",
                    account.id,
                    task_id,
                    previous
                );
                peak.fetch_max(holders.len(), Ordering::SeqCst);
                bindings.fetch_add(1, Ordering::SeqCst);

                tokio::task::yield_now().await;
                tokio::time::sleep(Duration::from_millis(2)).await;

                holders.remove(&account.id);
                assert!(accounts.release(&account.id, &task_id).await.unwrap());
                held += 1;
            }
        });
    }

    let joined = tokio::time::timeout(Duration::from_secs(60), async {
        while let Some(result) = tasks.join_next().await {
            result.unwrap();
        }
    })
    .await;
    assert!(joined.is_ok(), "binders did not finish in time");

    assert_eq!(bindings.load(Ordering::SeqCst), TASKS * ROUNDS);
    assert!(peak.load(Ordering::SeqCst) <= ACCOUNTS);
    for account in accounts.list(Platform::Jimeng).await.unwrap() {
        assert!(account.bound_task_id.is_none());
    }
}

#[tokio::test]
async fn bound_account_is_not_selected_until_released() {
    let dir = TempDir::new().unwrap();
    let accounts = file_pool(&dir, 4).await;
    accounts
        .add_accounts(Platform::Jimeng, "solo----pw----sid=1")
        .await
        .unwrap();

    let first = accounts
        .select_account(Platform::Jimeng, PipelineKind::Text2Img, "t1")
        .await
        .unwrap();
    let second = accounts
        .select_account(Platform::Jimeng, PipelineKind::Text2Img, "t2")
        .await;
    assert!(matches!(second, Err(Error::NoEligibleAccount { .. })));

    // Only the holding task can release the binding.
    assert!(!accounts.release(&first.id, "t2").await.unwrap());
    assert!(accounts.release(&first.id, "t1").await.unwrap());

    let again = accounts
        .select_account(Platform::Jimeng, PipelineKind::Text2Img, "t2")
        .await
        .unwrap();
    assert_eq!(again.id, first.id);
}
