//! Worker pool implementation.
//!
//! Every pipeline kind gets a fixed number of execution units. All units share
//! one semaphore, so the number of tasks executing at once never exceeds the
//! global thread cap no matter how many units exist.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, Semaphore, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::slots::{LivenessGuard, SlotRegistry, ThreadInfo};
use crate::Error;
use crate::accounts::{Account, AccountPool};
use crate::database::models::UsageOutcome;
use crate::domain::{FailureKind, ManagerState, PipelineKind};
use crate::executor::{ExecutionFailure, ExecutionRequest, ExecutorRegistry};
use crate::queue::{Task, TaskQueue, TaskResult};

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Execution units per pipeline kind.
    pub workers_per_kind: usize,
    /// Idle poll interval in milliseconds.
    pub poll_interval_ms: u64,
    /// Upper bound for a single executor run in seconds (0 disables).
    pub task_timeout_secs: u64,
    /// Directory handed to executors for their artifacts.
    pub output_dir: PathBuf,
    pub hide_window: bool,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            workers_per_kind: 2,
            poll_interval_ms: 500,
            task_timeout_secs: 1800,
            output_dir: PathBuf::from("outputs"),
            hide_window: false,
        }
    }
}

/// Collaborators shared by every unit.
#[derive(Clone)]
pub struct WorkerDeps {
    pub queue: Arc<TaskQueue>,
    pub accounts: Arc<AccountPool>,
    pub executors: ExecutorRegistry,
}

/// Decrements the active-task counter when a claimed task is done with.
struct ActiveGuard {
    active: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

impl ActiveGuard {
    fn new(active: Arc<AtomicUsize>, idle: Arc<Notify>) -> Self {
        active.fetch_add(1, Ordering::SeqCst);
        Self { active, idle }
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        if self.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }
}

/// What one unit iteration achieved, deciding whether it waits before the next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    /// A task was taken to a terminal status; try the next one right away.
    Processed,
    /// Nothing to do, or the task went back to the queue.
    Idle,
}

/// A pool of execution units across all pipeline kinds.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    deps: WorkerDeps,
    semaphore: Arc<Semaphore>,
    max_threads: usize,
    slots: Arc<SlotRegistry>,
    /// Stops the unit loops.
    cancellation_token: CancellationToken,
    /// Aborts in-flight executor runs.
    execution_token: CancellationToken,
    active: Arc<AtomicUsize>,
    idle: Arc<Notify>,
    tasks: parking_lot::Mutex<Option<JoinSet<()>>>,
}

impl WorkerPool {
    pub fn new(config: WorkerPoolConfig, max_threads: usize, deps: WorkerDeps) -> Self {
        let max_threads = max_threads.max(1);
        Self {
            config,
            deps,
            semaphore: Arc::new(Semaphore::new(max_threads)),
            max_threads,
            slots: Arc::new(SlotRegistry::new()),
            cancellation_token: CancellationToken::new(),
            execution_token: CancellationToken::new(),
            active: Arc::new(AtomicUsize::new(0)),
            idle: Arc::new(Notify::new()),
            tasks: parking_lot::Mutex::new(None),
        }
    }

    /// Spawn every unit. Units only dequeue while `state` reads `running`.
    pub fn start(&self, state: watch::Receiver<ManagerState>) {
        let mut tasks = self.tasks.lock();
        if tasks.is_some() {
            return;
        }
        let mut join_set = JoinSet::new();

        info!(
            workers_per_kind = self.config.workers_per_kind,
            max_threads = self.max_threads,
            "Starting worker pool"
        );

        for kind in PipelineKind::ALL {
            if self.deps.executors.get(kind).is_none() {
                debug!(kind = %kind, "No executor registered; tasks of this kind will fail");
            }
            for index in 0..self.config.workers_per_kind {
                let unit = Unit {
                    id: self.slots.register(kind, index),
                    kind,
                    config: self.config.clone(),
                    deps: self.deps.clone(),
                    semaphore: self.semaphore.clone(),
                    slots: self.slots.clone(),
                    cancellation_token: self.cancellation_token.clone(),
                    execution_token: self.execution_token.clone(),
                    active: self.active.clone(),
                    idle: self.idle.clone(),
                };
                join_set.spawn(unit.run(state.clone()));
            }
        }

        *tasks = Some(join_set);
    }

    /// Abort every in-flight executor run. Aborted tasks fail with `Cancelled`.
    pub fn cancel_execution(&self) {
        self.execution_token.cancel();
    }

    /// Wait until no unit holds a claimed task.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.active_count() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Stop the unit loops and wait for them to exit.
    ///
    /// In-flight runs are cancelled first; callers wanting a grace period
    /// should `wait_idle` before calling this.
    pub async fn stop(&self) {
        info!("Stopping worker pool");
        self.execution_token.cancel();
        self.cancellation_token.cancel();

        let join_set = {
            let mut tasks = self.tasks.lock();
            tasks.take()
        };

        if let Some(mut join_set) = join_set {
            while let Some(result) = join_set.join_next().await {
                if let Err(e) = result {
                    if e.is_panic() {
                        error!("Worker unit panicked: {}", e);
                    }
                }
            }
        }

        info!("Worker pool stopped");
    }

    /// Number of claimed tasks that have not reached a terminal status.
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn max_threads(&self) -> usize {
        self.max_threads
    }

    pub fn slots(&self) -> &Arc<SlotRegistry> {
        &self.slots
    }

    pub fn threads(&self) -> Vec<ThreadInfo> {
        self.slots.snapshot()
    }

    pub fn is_running(&self) -> bool {
        !self.cancellation_token.is_cancelled()
    }
}

/// One execution unit bound to a pipeline kind.
struct Unit {
    id: String,
    kind: PipelineKind,
    config: WorkerPoolConfig,
    deps: WorkerDeps,
    semaphore: Arc<Semaphore>,
    slots: Arc<SlotRegistry>,
    cancellation_token: CancellationToken,
    execution_token: CancellationToken,
    active: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

impl Unit {
    async fn run(self, mut state: watch::Receiver<ManagerState>) {
        let _liveness = LivenessGuard {
            slots: self.slots.clone(),
            id: self.id.clone(),
        };
        let notifier = self.deps.queue.notifier(self.kind);
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms.max(1));
        let mut last = Step::Idle;

        loop {
            if self.cancellation_token.is_cancelled() {
                break;
            }

            // Paused or stopped: block until the state changes.
            if *state.borrow_and_update() != ManagerState::Running {
                tokio::select! {
                    _ = self.cancellation_token.cancelled() => break,
                    changed = state.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
                continue;
            }

            if last == Step::Idle {
                tokio::select! {
                    _ = self.cancellation_token.cancelled() => break,
                    _ = notifier.notified() => {}
                    _ = tokio::time::sleep(poll_interval) => {}
                    changed = state.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        continue;
                    }
                }
            }
            last = Step::Idle;

            if *state.borrow() != ManagerState::Running {
                continue;
            }

            let permit = match self.semaphore.clone().try_acquire_owned() {
                Ok(p) => p,
                Err(_) => continue,
            };

            let task = match self.deps.queue.dequeue_next(self.kind, &self.id).await {
                Ok(Some(task)) => task,
                Ok(None) => {
                    drop(permit);
                    continue;
                }
                Err(e) => {
                    error!(worker = %self.id, "Error dequeuing task: {}", e);
                    drop(permit);
                    continue;
                }
            };

            let _active = ActiveGuard::new(self.active.clone(), self.idle.clone());
            self.slots
                .set_claiming(&self.id, &task.id, task.payload.prompt());
            last = self.process(task).await;
            self.slots.set_idle(&self.id);
            drop(permit);
        }

        debug!(worker = %self.id, "Worker unit exited");
    }

    async fn process(&self, task: Task) -> Step {
        let account = match self
            .deps
            .accounts
            .select_account(task.platform, task.kind, &task.id)
            .await
        {
            Ok(account) => account,
            Err(e) => {
                if matches!(e, Error::NoEligibleAccount { .. }) {
                    debug!(task_id = %task.id, worker = %self.id, "{}", e);
                } else {
                    warn!(task_id = %task.id, worker = %self.id, "Account selection failed: {}", e);
                }
                if let Err(e) = self.deps.queue.release_to_tail(&task.id, &self.id).await {
                    warn!(task_id = %task.id, "Failed to return task to queue: {}", e);
                }
                return Step::Idle;
            }
        };

        // Stopping: never start a run that would be cancelled right away.
        if self.execution_token.is_cancelled() {
            self.release(&account, &task).await;
            if let Err(e) = self.deps.queue.release_to_tail(&task.id, &self.id).await {
                warn!(task_id = %task.id, "Failed to return task to queue: {}", e);
            }
            return Step::Idle;
        }

        if let Err(e) = self
            .deps
            .queue
            .mark_running(&task.id, &account.id, &self.id)
            .await
        {
            // Deleted or otherwise taken away between claim and start.
            warn!(task_id = %task.id, worker = %self.id, "Cannot start task: {}", e);
            self.release(&account, &task).await;
            if !e.is_not_found()
                && let Err(e) = self.deps.queue.release_to_tail(&task.id, &self.id).await
            {
                warn!(task_id = %task.id, "Failed to return task to queue: {}", e);
            }
            return Step::Idle;
        }
        self.slots.set_running(&self.id, &account.id);

        let Some(executor) = self.deps.executors.get(task.kind) else {
            warn!(task_id = %task.id, kind = %task.kind, "No executor registered");
            self.fail(&task, "no executor registered", FailureKind::NoExecutor)
                .await;
            self.release(&account, &task).await;
            return Step::Processed;
        };

        let request = ExecutionRequest {
            task_id: task.id.clone(),
            kind: task.kind,
            platform: task.platform,
            payload: task.payload.clone(),
            account_id: account.id.clone(),
            account_identifier: account.identifier.clone(),
            cookie: account.cookie.clone().unwrap_or_default(),
            output_dir: self.config.output_dir.clone(),
            hide_window: self.config.hide_window,
        };

        info!(
            task_id = %task.id,
            account_id = %account.id,
            worker = %self.id,
            executor = executor.name(),
            "Executing task"
        );

        let timeout_secs = self.config.task_timeout_secs;
        let outcome = tokio::select! {
            biased;
            _ = self.execution_token.cancelled() => {
                Err(ExecutionFailure::new(FailureKind::Cancelled, Error::Cancelled.to_string()))
            }
            result = run_with_timeout(executor.execute(&request), timeout_secs) => result,
        };

        let refreshed_cookie = match &outcome {
            Ok(output) => output.refreshed_cookie.clone(),
            Err(failure) => failure.refreshed_cookie.clone(),
        };

        let usage = match outcome {
            Ok(output) if output.artifacts.is_empty() => {
                self.fail(
                    &task,
                    "executor returned no artifacts",
                    FailureKind::GenerationFailed,
                )
                .await;
                UsageOutcome::Failure
            }
            Ok(output) => {
                let result = TaskResult {
                    artifacts: output.artifacts,
                    metadata: output.metadata,
                };
                if let Err(e) = self.deps.queue.mark_succeeded(&task.id, &result).await {
                    warn!(task_id = %task.id, "Failed to record success: {}", e);
                }
                UsageOutcome::Success
            }
            Err(failure) => {
                self.fail(&task, &failure.message, failure.kind).await;
                if failure.kind == FailureKind::Cancelled {
                    UsageOutcome::Aborted
                } else {
                    UsageOutcome::Failure
                }
            }
        };

        let refreshed_cookie = refreshed_cookie
            .filter(|c| !c.trim().is_empty() && account.cookie.as_deref() != Some(c.as_str()));
        if let Some(cookie) = refreshed_cookie {
            match self.deps.accounts.store_rotated_cookie(&account.id, &cookie).await {
                Ok(_) => debug!(account_id = %account.id, "Stored refreshed cookie"),
                Err(e) => warn!(account_id = %account.id, "Failed to store cookie: {}", e),
            }
        }

        if let Err(e) = self
            .deps
            .accounts
            .record_usage(&account.id, task.kind, usage)
            .await
        {
            warn!(account_id = %account.id, "Failed to record usage: {}", e);
        }

        self.release(&account, &task).await;
        Step::Processed
    }

    async fn fail(&self, task: &Task, message: &str, kind: FailureKind) {
        if let Err(e) = self.deps.queue.mark_failed(&task.id, message, kind).await {
            warn!(task_id = %task.id, "Failed to record failure: {}", e);
        }
    }

    async fn release(&self, account: &Account, task: &Task) {
        match self.deps.accounts.release(&account.id, &task.id).await {
            Ok(true) => {}
            Ok(false) => debug!(account_id = %account.id, task_id = %task.id, "Binding already released"),
            Err(e) => warn!(account_id = %account.id, "Failed to release account: {}", e),
        }
    }
}

async fn run_with_timeout<F>(
    run: F,
    timeout_secs: u64,
) -> std::result::Result<crate::executor::ExecutionOutput, ExecutionFailure>
where
    F: std::future::Future<
            Output = std::result::Result<crate::executor::ExecutionOutput, ExecutionFailure>,
        >,
{
    if timeout_secs == 0 {
        return run.await;
    }
    match tokio::time::timeout(Duration::from_secs(timeout_secs), run).await {
        Ok(result) => result,
        Err(_) => Err(ExecutionFailure::new(
            FailureKind::Timeout,
            format!("task timed out after {}s", timeout_secs),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::{AccountPoolConfig, UnconfiguredCredentialProvider};
    use crate::database::repositories::{SqlxAccountRepository, SqlxTaskRepository};
    use crate::database::test_pool;
    use crate::domain::{AccountHealth, Platform, TaskStatus};
    use crate::executor::{ExecutionOutput, PipelineExecutor};
    use async_trait::async_trait;
    use serde_json::json;

    struct EchoExecutor;

    #[async_trait]
    impl PipelineExecutor for EchoExecutor {
        fn name(&self) -> &'static str {
            "echo"
        }

        async fn execute(
            &self,
            request: &ExecutionRequest,
        ) -> std::result::Result<ExecutionOutput, ExecutionFailure> {
            Ok(ExecutionOutput {
                artifacts: vec![format!("{}.png", request.task_id)],
                metadata: None,
                refreshed_cookie: Some("sid=rotated".into()),
            })
        }
    }

    /// Fails every run but hands back a fresh cookie each time.
    #[derive(Default)]
    struct RotatingFailExecutor {
        runs: AtomicUsize,
    }

    #[async_trait]
    impl PipelineExecutor for RotatingFailExecutor {
        fn name(&self) -> &'static str {
            "rotating-fail"
        }

        async fn execute(
            &self,
            _request: &ExecutionRequest,
        ) -> std::result::Result<ExecutionOutput, ExecutionFailure> {
            let n = self.runs.fetch_add(1, Ordering::SeqCst);
            Err(
                ExecutionFailure::new(FailureKind::GenerationFailed, "generation failed")
                    .with_cookie(Some(format!("sid=rot{n}"))),
            )
        }
    }

    async fn deps(executors: ExecutorRegistry) -> WorkerDeps {
        let db = test_pool().await;
        let queue = Arc::new(TaskQueue::new(Arc::new(SqlxTaskRepository::new(db.clone()))));
        let accounts = Arc::new(AccountPool::new(
            Arc::new(SqlxAccountRepository::new(db)),
            Arc::new(UnconfiguredCredentialProvider),
            AccountPoolConfig::default(),
        ));
        WorkerDeps {
            queue,
            accounts,
            executors,
        }
    }

    fn fast_config() -> WorkerPoolConfig {
        WorkerPoolConfig {
            workers_per_kind: 1,
            poll_interval_ms: 10,
            ..Default::default()
        }
    }

    async fn wait_for_status(queue: &TaskQueue, id: &str, status: TaskStatus) -> Task {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let task = queue.get(id).await.unwrap();
                if task.status == status {
                    return task;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("task did not reach expected status")
    }

    #[test]
    fn test_worker_pool_config_default() {
        let config = WorkerPoolConfig::default();
        assert_eq!(config.workers_per_kind, 2);
        assert_eq!(config.task_timeout_secs, 1800);
    }

    #[tokio::test]
    async fn test_unit_runs_task_and_stores_cookie() {
        let executors = ExecutorRegistry::new().with(PipelineKind::Text2Img, Arc::new(EchoExecutor));
        let deps = deps(executors).await;
        deps.accounts
            .add_accounts(Platform::Jimeng, "alice----pw----sid=1")
            .await
            .unwrap();
        let task = deps
            .queue
            .enqueue(PipelineKind::Text2Img, None, json!({"prompt": "lake"}))
            .await
            .unwrap();

        let (tx, rx) = watch::channel(ManagerState::Running);
        let pool = WorkerPool::new(fast_config(), 2, deps.clone());
        pool.start(rx);
        assert_eq!(pool.threads().len(), PipelineKind::ALL.len());

        let done = wait_for_status(&deps.queue, &task.id, TaskStatus::Succeeded).await;
        assert_eq!(done.result.unwrap().artifacts, vec![format!("{}.png", task.id)]);

        pool.wait_idle().await;
        let account = &deps.accounts.list(Platform::Jimeng).await.unwrap()[0];
        assert_eq!(account.cookie.as_deref(), Some("sid=rotated"));
        assert_eq!(account.usage_count, 1);
        assert!(account.bound_task_id.is_none());

        tx.send_replace(ManagerState::Stopped);
        pool.stop().await;
        assert_eq!(pool.slots().live_count(), 0);
    }

    #[tokio::test]
    async fn test_rotated_cookie_keeps_failure_streak() {
        let executor = Arc::new(RotatingFailExecutor::default());
        let executors = ExecutorRegistry::new().with(PipelineKind::Text2Img, executor.clone());
        let deps = deps(executors).await;
        deps.accounts
            .add_accounts(Platform::Jimeng, "alice----pw----sid=1")
            .await
            .unwrap();
        let threshold = deps.accounts.config().failure_threshold as usize;
        let mut ids = Vec::new();
        for i in 0..threshold + 1 {
            let task = deps
                .queue
                .enqueue(PipelineKind::Text2Img, None, json!({ "prompt": format!("p{i}") }))
                .await
                .unwrap();
            ids.push(task.id);
        }

        let (_tx, rx) = watch::channel(ManagerState::Running);
        let pool = WorkerPool::new(fast_config(), 1, deps.clone());
        pool.start(rx);
        for id in &ids[..threshold] {
            wait_for_status(&deps.queue, id, TaskStatus::Failed).await;
        }
        pool.wait_idle().await;

        let account = &deps.accounts.list(Platform::Jimeng).await.unwrap()[0];
        assert_eq!(account.health, AccountHealth::Unhealthy);
        assert_eq!(account.consecutive_failures as usize, threshold);
        assert_eq!(account.usage_count as usize, threshold);
        assert_eq!(
            account.cookie.as_deref(),
            Some(format!("sid=rot{}", threshold - 1).as_str())
        );

        // An unhealthy account is never selected again.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let last = deps.queue.get(&ids[threshold]).await.unwrap();
        assert_eq!(last.status, TaskStatus::Pending);
        assert_eq!(executor.runs.load(Ordering::SeqCst), threshold);
        pool.stop().await;
    }

    #[tokio::test]
    async fn test_missing_executor_fails_task() {
        let deps = deps(ExecutorRegistry::new()).await;
        deps.accounts
            .add_accounts(Platform::Jimeng, "alice----pw----sid=1")
            .await
            .unwrap();
        let task = deps
            .queue
            .enqueue(PipelineKind::Text2Video, None, json!({"prompt": "rain"}))
            .await
            .unwrap();

        let (_tx, rx) = watch::channel(ManagerState::Running);
        let pool = WorkerPool::new(fast_config(), 1, deps.clone());
        pool.start(rx);

        let failed = wait_for_status(&deps.queue, &task.id, TaskStatus::Failed).await;
        assert_eq!(failed.failure_kind, Some(FailureKind::NoExecutor));
        pool.stop().await;
    }

    #[tokio::test]
    async fn test_paused_units_do_not_dequeue() {
        let executors = ExecutorRegistry::new().with(PipelineKind::Text2Img, Arc::new(EchoExecutor));
        let deps = deps(executors).await;
        deps.accounts
            .add_accounts(Platform::Jimeng, "alice----pw----sid=1")
            .await
            .unwrap();
        let task = deps
            .queue
            .enqueue(PipelineKind::Text2Img, None, json!({"prompt": "lake"}))
            .await
            .unwrap();

        let (tx, rx) = watch::channel(ManagerState::Paused);
        let pool = WorkerPool::new(fast_config(), 1, deps.clone());
        pool.start(rx);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(
            deps.queue.get(&task.id).await.unwrap().status,
            TaskStatus::Pending
        );

        tx.send_replace(ManagerState::Running);
        wait_for_status(&deps.queue, &task.id, TaskStatus::Succeeded).await;
        pool.stop().await;
    }
}
