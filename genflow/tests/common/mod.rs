//! Shared fixtures for integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use genflow::accounts::{AccountPool, AccountPoolConfig, UnconfiguredCredentialProvider};
use genflow::config::SettingsService;
use genflow::database::repositories::{
    SqlxAccountRepository, SqlxSettingsRepository, SqlxTaskRepository,
};
use genflow::database::{DbPool, init_pool_with_size, run_migrations};
use genflow::executor::{ExecutionFailure, ExecutionOutput, ExecutionRequest, PipelineExecutor};
use genflow::executor::ExecutorRegistry;
use genflow::manager::{TaskManager, TaskManagerConfig};
use genflow::queue::{Task, TaskQueue};
use genflow::worker::WorkerPoolConfig;

/// Single-connection in-memory database with the schema applied.
pub async fn memory_pool() -> DbPool {
    let pool = init_pool_with_size("sqlite::memory:", 1).await.unwrap();
    run_migrations(&pool).await.unwrap();
    pool
}

pub fn manager_config(stop_grace_secs: u64) -> TaskManagerConfig {
    TaskManagerConfig {
        workers: WorkerPoolConfig {
            workers_per_kind: 2,
            poll_interval_ms: 10,
            task_timeout_secs: 0,
            ..Default::default()
        },
        stop_grace_secs,
        ..Default::default()
    }
}

pub fn build_manager(
    db: &DbPool,
    config: TaskManagerConfig,
    executors: ExecutorRegistry,
) -> Arc<TaskManager> {
    let queue = Arc::new(TaskQueue::new(Arc::new(SqlxTaskRepository::new(db.clone()))));
    let accounts = Arc::new(AccountPool::new(
        Arc::new(SqlxAccountRepository::new(db.clone())),
        Arc::new(UnconfiguredCredentialProvider),
        AccountPoolConfig::default(),
    ));
    let settings = Arc::new(SettingsService::new(Arc::new(SqlxSettingsRepository::new(
        db.clone(),
    ))));
    Arc::new(TaskManager::new(config, queue, accounts, executors, settings))
}

/// Poll `check` until it returns true or `timeout` elapses.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

pub async fn wait_for_terminal(queue: &TaskQueue, task_id: &str) -> Task {
    let finished = wait_until(Duration::from_secs(10), || async {
        queue.get(task_id).await.unwrap().status.is_terminal()
    })
    .await;
    assert!(finished, "task {} did not finish", task_id);
    queue.get(task_id).await.unwrap()
}

/// Succeeds immediately and remembers which account ran each task.
#[derive(Default)]
pub struct RecordingExecutor {
    pub runs: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl PipelineExecutor for RecordingExecutor {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn execute(
        &self,
        request: &ExecutionRequest,
    ) -> Result<ExecutionOutput, ExecutionFailure> {
        self.runs
            .lock()
            .push((request.task_id.clone(), request.account_id.clone()));
        Ok(ExecutionOutput {
            artifacts: vec![format!("https://cdn.example/{}.png", request.task_id)],
            ..Default::default()
        })
    }
}

/// Never finishes on its own.
pub struct BlockingExecutor;

#[async_trait]
impl PipelineExecutor for BlockingExecutor {
    fn name(&self) -> &'static str {
        "blocking"
    }

    async fn execute(
        &self,
        _request: &ExecutionRequest,
    ) -> Result<ExecutionOutput, ExecutionFailure> {
        futures::future::pending().await
    }
}
