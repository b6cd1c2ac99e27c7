//! Liveness reaper: returns tasks abandoned by dead worker units to the queue.

use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::Result;
use crate::accounts::AccountPool;
use crate::queue::TaskQueue;
use crate::worker::SlotRegistry;

/// Reset every running or claimed task that no live unit holds and that has
/// not been touched for `threshold`. Returns the number of tasks reset.
pub async fn reap_abandoned(
    queue: &TaskQueue,
    accounts: &AccountPool,
    held: &HashSet<String>,
    threshold: Duration,
) -> Result<u64> {
    let threshold = chrono::Duration::from_std(threshold).unwrap_or(chrono::Duration::MAX);
    let now = Utc::now();
    let mut reset = 0;

    for task in queue.in_flight().await? {
        if held.contains(&task.id) {
            continue;
        }
        let last_touched = task.started_at.unwrap_or(task.updated_at).max(task.updated_at);
        if now - last_touched < threshold {
            continue;
        }
        if queue.reset_abandoned(&task.id).await? {
            let released = accounts.release_task(&task.id).await?;
            warn!(
                task_id = %task.id,
                kind = %task.kind,
                claimed_by = ?task.claimed_by,
                released_accounts = released,
                "Reset abandoned task to pending"
            );
            reset += 1;
        }
    }
    Ok(reset)
}

/// Run [`reap_abandoned`] every `interval` until `token` is cancelled.
pub fn spawn_reaper(
    queue: Arc<TaskQueue>,
    accounts: Arc<AccountPool>,
    slots: Arc<SlotRegistry>,
    interval: Duration,
    threshold: Duration,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let held = slots.held_task_ids();
            match reap_abandoned(&queue, &accounts, &held, threshold).await {
                Ok(0) => {}
                Ok(n) => debug!(reset = n, "Liveness sweep finished"),
                Err(e) => error!("Liveness sweep failed: {}", e),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::{AccountPoolConfig, UnconfiguredCredentialProvider};
    use crate::database::repositories::{SqlxAccountRepository, SqlxTaskRepository};
    use crate::database::test_pool;
    use crate::domain::{PipelineKind, Platform, TaskStatus};
    use serde_json::json;

    #[tokio::test]
    async fn test_reaps_only_unheld_tasks() {
        let db = test_pool().await;
        let queue = TaskQueue::new(Arc::new(SqlxTaskRepository::new(db.clone())));
        let accounts = AccountPool::new(
            Arc::new(SqlxAccountRepository::new(db)),
            Arc::new(UnconfiguredCredentialProvider),
            AccountPoolConfig::default(),
        );
        accounts
            .add_accounts(Platform::Jimeng, "a----pw----c1\nb----pw----c2")
            .await
            .unwrap();

        let mut ids = Vec::new();
        for _ in 0..2 {
            let task = queue
                .enqueue(PipelineKind::Text2Img, None, json!({"prompt": "p"}))
                .await
                .unwrap();
            queue
                .dequeue_next(PipelineKind::Text2Img, "text2img-0")
                .await
                .unwrap();
            let account = accounts
                .select_account(Platform::Jimeng, PipelineKind::Text2Img, &task.id)
                .await
                .unwrap();
            queue
                .mark_running(&task.id, &account.id, "text2img-0")
                .await
                .unwrap();
            ids.push(task.id);
        }

        let held: HashSet<String> = [ids[0].clone()].into_iter().collect();
        let reset = reap_abandoned(&queue, &accounts, &held, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(reset, 1);

        assert_eq!(queue.get(&ids[0]).await.unwrap().status, TaskStatus::Running);
        let reaped = queue.get(&ids[1]).await.unwrap();
        assert_eq!(reaped.status, TaskStatus::Pending);
        assert!(reaped.bound_account_id.is_none());
        let bound: Vec<_> = accounts
            .list(Platform::Jimeng)
            .await
            .unwrap()
            .into_iter()
            .filter_map(|a| a.bound_task_id)
            .collect();
        assert_eq!(bound, vec![ids[0].clone()]);
    }

    #[tokio::test]
    async fn test_recent_tasks_are_left_alone() {
        let db = test_pool().await;
        let queue = TaskQueue::new(Arc::new(SqlxTaskRepository::new(db.clone())));
        let accounts = AccountPool::new(
            Arc::new(SqlxAccountRepository::new(db)),
            Arc::new(UnconfiguredCredentialProvider),
            AccountPoolConfig::default(),
        );
        queue
            .enqueue(PipelineKind::Img2Video, None, json!({"image_path": "/x.png"}))
            .await
            .unwrap();
        queue
            .dequeue_next(PipelineKind::Img2Video, "img2video-0")
            .await
            .unwrap();

        let reset = reap_abandoned(&queue, &accounts, &HashSet::new(), Duration::from_secs(120))
            .await
            .unwrap();
        assert_eq!(reset, 0);
    }
}
