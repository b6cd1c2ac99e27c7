//! The task manager supervisor.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::health::{ComponentHealth, HealthReport, SystemProbe};
use super::reaper::{reap_abandoned, spawn_reaper};
use crate::Result;
use crate::accounts::{AccountPool, PlatformHealthCounts};
use crate::config::SettingsService;
use crate::domain::{ManagerState, PipelineKind, Platform};
use crate::executor::ExecutorRegistry;
use crate::queue::{StatusCounts, TaskQueue};
use crate::worker::{ThreadInfo, WorkerDeps, WorkerPool, WorkerPoolConfig};

/// Task manager configuration.
#[derive(Debug, Clone)]
pub struct TaskManagerConfig {
    pub workers: WorkerPoolConfig,
    /// How long `stop` waits for in-flight tasks before cancelling them.
    pub stop_grace_secs: u64,
    /// Age after which an unheld running task is considered abandoned.
    pub liveness_threshold_secs: u64,
    pub reaper_interval_secs: u64,
}

impl Default for TaskManagerConfig {
    fn default() -> Self {
        Self {
            workers: WorkerPoolConfig::default(),
            stop_grace_secs: 30,
            liveness_threshold_secs: 120,
            reaper_interval_secs: 30,
        }
    }
}

/// Aggregated counts across queues and the account pool.
#[derive(Debug, Clone, Serialize)]
pub struct ManagerSummary {
    pub state: ManagerState,
    pub kinds: BTreeMap<PipelineKind, StatusCounts>,
    pub total: StatusCounts,
    pub accounts: BTreeMap<Platform, PlatformHealthCounts>,
    pub eligible_accounts: u64,
    /// Claimed tasks not yet finished.
    pub active_tasks: usize,
    pub max_threads: usize,
}

struct Reaper {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Owns the worker pool and exposes the global control surface.
///
/// Transitions: `stopped -> running` (start), `running -> paused` (pause),
/// `paused -> running` (resume), `running|paused -> stopped` (stop). A
/// transition requested from any other state is a no-op and returns `false`.
pub struct TaskManager {
    config: TaskManagerConfig,
    queue: Arc<TaskQueue>,
    accounts: Arc<AccountPool>,
    executors: ExecutorRegistry,
    settings: Arc<SettingsService>,
    state: watch::Sender<ManagerState>,
    /// Serializes transitions.
    transition: tokio::sync::Mutex<()>,
    pool: parking_lot::RwLock<Option<Arc<WorkerPool>>>,
    reaper: parking_lot::Mutex<Option<Reaper>>,
    probe: SystemProbe,
    started_at: Instant,
}

impl TaskManager {
    pub fn new(
        config: TaskManagerConfig,
        queue: Arc<TaskQueue>,
        accounts: Arc<AccountPool>,
        executors: ExecutorRegistry,
        settings: Arc<SettingsService>,
    ) -> Self {
        let (state, _) = watch::channel(ManagerState::Stopped);
        Self {
            config,
            queue,
            accounts,
            executors,
            settings,
            state,
            transition: tokio::sync::Mutex::new(()),
            pool: parking_lot::RwLock::new(None),
            reaper: parking_lot::Mutex::new(None),
            probe: SystemProbe::new(),
            started_at: Instant::now(),
        }
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    pub fn accounts(&self) -> &Arc<AccountPool> {
        &self.accounts
    }

    pub fn settings(&self) -> &Arc<SettingsService> {
        &self.settings
    }

    pub fn get_status(&self) -> ManagerState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<ManagerState> {
        self.state.subscribe()
    }

    fn current_pool(&self) -> Option<Arc<WorkerPool>> {
        self.pool.read().clone()
    }

    /// Startup recovery: nothing can be in flight before the first start.
    pub async fn recover(&self) -> Result<()> {
        let _guard = self.transition.lock().await;
        if self.get_status() != ManagerState::Stopped {
            return Ok(());
        }
        let tasks = self.queue.recover().await?;
        let bindings = self.accounts.clear_bindings().await?;
        info!(tasks, bindings, "Recovered interrupted work");
        Ok(())
    }

    pub async fn start(&self) -> Result<bool> {
        let _guard = self.transition.lock().await;
        if self.get_status() != ManagerState::Stopped {
            return Ok(false);
        }

        let settings = self.settings.get().await?;
        let mut workers = self.config.workers.clone();
        workers.hide_window = settings.hide_window;
        let pool = Arc::new(WorkerPool::new(
            workers,
            settings.automation_max_threads as usize,
            WorkerDeps {
                queue: self.queue.clone(),
                accounts: self.accounts.clone(),
                executors: self.executors.clone(),
            },
        ));

        self.state.send_replace(ManagerState::Running);
        pool.start(self.state.subscribe());

        let token = CancellationToken::new();
        let handle = spawn_reaper(
            self.queue.clone(),
            self.accounts.clone(),
            pool.slots().clone(),
            Duration::from_secs(self.config.reaper_interval_secs.max(1)),
            Duration::from_secs(self.config.liveness_threshold_secs),
            token.clone(),
        );
        *self.reaper.lock() = Some(Reaper { token, handle });
        *self.pool.write() = Some(pool);

        info!(
            max_threads = settings.automation_max_threads,
            "Task manager started"
        );
        Ok(true)
    }

    pub async fn pause(&self) -> Result<bool> {
        let _guard = self.transition.lock().await;
        if self.get_status() != ManagerState::Running {
            return Ok(false);
        }
        self.state.send_replace(ManagerState::Paused);
        info!("Task manager paused");
        Ok(true)
    }

    pub async fn resume(&self) -> Result<bool> {
        let _guard = self.transition.lock().await;
        if self.get_status() != ManagerState::Paused {
            return Ok(false);
        }
        self.state.send_replace(ManagerState::Running);
        info!("Task manager resumed");
        Ok(true)
    }

    /// Stop dequeuing, give in-flight tasks the grace period, then cancel
    /// whatever is still running and tear the units down.
    pub async fn stop(&self) -> Result<bool> {
        let _guard = self.transition.lock().await;
        if self.get_status() == ManagerState::Stopped {
            return Ok(false);
        }
        self.state.send_replace(ManagerState::Stopped);

        if let Some(pool) = self.current_pool() {
            let grace = Duration::from_secs(self.config.stop_grace_secs);
            if tokio::time::timeout(grace, pool.wait_idle()).await.is_err() {
                warn!(
                    in_flight = pool.active_count(),
                    grace_secs = self.config.stop_grace_secs,
                    "Grace period elapsed, cancelling in-flight tasks"
                );
                pool.cancel_execution();
            }
            pool.stop().await;
        }

        let reaper = self.reaper.lock().take();
        if let Some(reaper) = reaper {
            reaper.token.cancel();
            if let Err(e) = reaper.handle.await {
                warn!("Reaper task ended abnormally: {}", e);
            }
        }
        *self.pool.write() = None;

        info!("Task manager stopped");
        Ok(true)
    }

    pub async fn get_summary(&self) -> Result<ManagerSummary> {
        let snapshot = self.queue.snapshot().await?;
        let accounts = self.accounts.health_counts().await?;
        let eligible_accounts = accounts.values().map(|c| c.eligible).sum();
        let (active_tasks, max_threads) = match self.current_pool() {
            Some(pool) => (pool.active_count(), pool.max_threads()),
            None => (0, 0),
        };
        Ok(ManagerSummary {
            state: self.get_status(),
            kinds: snapshot.kinds,
            total: snapshot.total,
            accounts,
            eligible_accounts,
            active_tasks,
            max_threads,
        })
    }

    /// Every worker unit; empty while stopped.
    pub fn get_threads(&self) -> Vec<ThreadInfo> {
        self.current_pool()
            .map(|pool| pool.threads())
            .unwrap_or_default()
    }

    /// Run one liveness sweep now.
    pub async fn reap_abandoned(&self) -> Result<u64> {
        let held = self
            .current_pool()
            .map(|pool| pool.slots().held_task_ids())
            .unwrap_or_default();
        reap_abandoned(
            &self.queue,
            &self.accounts,
            &held,
            Duration::from_secs(self.config.liveness_threshold_secs),
        )
        .await
    }

    pub async fn health(&self) -> HealthReport {
        let state = self.get_status();
        let components = vec![
            self.check_workers(state),
            self.check_repository().await,
            self.check_accounts().await,
        ];
        HealthReport::from_components(
            state,
            components,
            self.started_at.elapsed(),
            self.probe.sample().await,
        )
    }

    fn check_workers(&self, state: ManagerState) -> ComponentHealth {
        let Some(pool) = self.current_pool() else {
            return ComponentHealth::healthy("workers").with_message(format!("manager {}", state));
        };
        let total = pool.slots().total();
        let live = pool.slots().live_count();
        if live == 0 && total > 0 {
            ComponentHealth::unhealthy("workers", "no live worker units")
        } else if live < total {
            ComponentHealth::degraded(
                "workers",
                format!("{} of {} worker units exited", total - live, total),
            )
        } else {
            ComponentHealth::healthy("workers").with_message(format!(
                "{} units, {} active tasks",
                live,
                pool.active_count()
            ))
        }
    }

    async fn check_repository(&self) -> ComponentHealth {
        let start = Instant::now();
        let health = match self.queue.ping().await {
            Ok(()) => ComponentHealth::healthy("repository"),
            Err(e) => ComponentHealth::unhealthy("repository", e.to_string()),
        };
        health.with_duration(start.elapsed())
    }

    async fn check_accounts(&self) -> ComponentHealth {
        let start = Instant::now();
        let health = match (
            self.accounts.health_counts().await,
            self.queue.pending_by_platform().await,
        ) {
            (Ok(counts), Ok(pending)) => {
                let starved: Vec<String> = pending
                    .iter()
                    .filter(|(platform, count)| {
                        **count > 0 && counts.get(platform).is_none_or(|c| c.eligible == 0)
                    })
                    .map(|(platform, count)| format!("{} ({} pending)", platform, count))
                    .collect();
                if starved.is_empty() {
                    let eligible: Vec<String> = counts
                        .iter()
                        .map(|(platform, c)| format!("{}={}", platform, c.eligible))
                        .collect();
                    ComponentHealth::healthy("accounts")
                        .with_message(format!("eligible: {}", eligible.join(", ")))
                } else {
                    ComponentHealth::degraded(
                        "accounts",
                        format!("no eligible accounts on {}", starved.join(", ")),
                    )
                }
            }
            (Err(e), _) | (_, Err(e)) => ComponentHealth::unhealthy("accounts", e.to_string()),
        };
        health.with_duration(start.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::{AccountPoolConfig, UnconfiguredCredentialProvider};
    use crate::database::repositories::{
        SqlxAccountRepository, SqlxSettingsRepository, SqlxTaskRepository,
    };
    use crate::database::test_pool;
    use crate::manager::HealthStatus;
    use serde_json::json;

    async fn manager() -> TaskManager {
        let db = test_pool().await;
        TaskManager::new(
            TaskManagerConfig {
                workers: WorkerPoolConfig {
                    workers_per_kind: 1,
                    poll_interval_ms: 10,
                    ..Default::default()
                },
                stop_grace_secs: 0,
                ..Default::default()
            },
            Arc::new(TaskQueue::new(Arc::new(SqlxTaskRepository::new(db.clone())))),
            Arc::new(AccountPool::new(
                Arc::new(SqlxAccountRepository::new(db.clone())),
                Arc::new(UnconfiguredCredentialProvider),
                AccountPoolConfig::default(),
            )),
            ExecutorRegistry::new(),
            Arc::new(SettingsService::new(Arc::new(SqlxSettingsRepository::new(db)))),
        )
    }

    #[tokio::test]
    async fn test_transitions() {
        let manager = manager().await;
        assert_eq!(manager.get_status(), ManagerState::Stopped);
        assert!(!manager.pause().await.unwrap());
        assert!(!manager.resume().await.unwrap());
        assert!(!manager.stop().await.unwrap());

        assert!(manager.start().await.unwrap());
        assert!(!manager.start().await.unwrap());
        assert_eq!(manager.get_threads().len(), PipelineKind::ALL.len());

        assert!(manager.pause().await.unwrap());
        assert!(!manager.pause().await.unwrap());
        assert_eq!(manager.get_status(), ManagerState::Paused);
        assert!(manager.resume().await.unwrap());

        assert!(manager.stop().await.unwrap());
        assert_eq!(manager.get_status(), ManagerState::Stopped);
        assert!(manager.get_threads().is_empty());

        // A stopped manager can be started again.
        assert!(manager.start().await.unwrap());
        assert!(manager.stop().await.unwrap());
    }

    #[tokio::test]
    async fn test_health_degrades_without_eligible_accounts() {
        let manager = manager().await;
        assert!(manager.health().await.is_healthy());

        manager
            .queue()
            .enqueue(PipelineKind::Text2Img, None, json!({"prompt": "p"}))
            .await
            .unwrap();
        let report = manager.health().await;
        assert_eq!(report.status, HealthStatus::Degraded);
        assert!(report.reason.unwrap().contains("jimeng"));

        manager
            .accounts()
            .add_accounts(Platform::Jimeng, "a----pw----c1")
            .await
            .unwrap();
        assert!(manager.health().await.is_healthy());
    }

    #[tokio::test]
    async fn test_summary_counts() {
        let manager = manager().await;
        manager
            .queue()
            .enqueue(PipelineKind::Text2Img, None, json!({"prompt": "p"}))
            .await
            .unwrap();
        manager
            .accounts()
            .add_accounts(Platform::Jimeng, "a----pw----c1\nb----pw")
            .await
            .unwrap();

        let summary = manager.get_summary().await.unwrap();
        assert_eq!(summary.state, ManagerState::Stopped);
        assert_eq!(summary.kinds[&PipelineKind::Text2Img].pending, 1);
        assert_eq!(summary.total.total, 1);
        assert_eq!(summary.eligible_accounts, 1);
        assert_eq!(summary.accounts[&Platform::Jimeng].total, 2);
    }
}
