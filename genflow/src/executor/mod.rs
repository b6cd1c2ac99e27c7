//! Pipeline executors.
//!
//! An executor performs the long-running external generation call for one
//! task. Workers invoke it without holding any queue or account lock.

pub mod command;

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

use crate::domain::{FailureKind, PipelineKind, Platform, TaskPayload};

pub use command::{CommandError, CommandExecutor, run_json_command};

/// Everything an executor needs to run one task.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub task_id: String,
    pub kind: PipelineKind,
    pub platform: Platform,
    pub payload: TaskPayload,
    pub account_id: String,
    pub account_identifier: String,
    pub cookie: String,
    /// Directory the executor should write artifacts into.
    pub output_dir: PathBuf,
    pub hide_window: bool,
}

/// Successful execution.
#[derive(Debug, Clone, Default)]
pub struct ExecutionOutput {
    /// Local paths or URLs of generated assets.
    pub artifacts: Vec<String>,
    pub metadata: Option<Value>,
    /// Cookie the platform issued during the run, to be stored on the account.
    pub refreshed_cookie: Option<String>,
}

/// Failed execution, classified for observability and account health.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ExecutionFailure {
    pub kind: FailureKind,
    pub message: String,
    pub refreshed_cookie: Option<String>,
}

impl ExecutionFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            refreshed_cookie: None,
        }
    }

    pub fn with_cookie(mut self, cookie: Option<String>) -> Self {
        self.refreshed_cookie = cookie;
        self
    }
}

/// Trait for pipeline executors.
#[async_trait]
pub trait PipelineExecutor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Run the generation for one task.
    ///
    /// # Cancel Safety
    ///
    /// The worker drops this future on forced stop or timeout. Implementations
    /// must not leave external processes running when dropped.
    async fn execute(
        &self,
        request: &ExecutionRequest,
    ) -> std::result::Result<ExecutionOutput, ExecutionFailure>;
}

/// Executors keyed by pipeline kind.
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<PipelineKind, Arc<dyn PipelineExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry of [`CommandExecutor`]s from per-kind shell commands.
    pub fn from_commands(commands: &HashMap<PipelineKind, String>, timeout_secs: u64) -> Self {
        let mut registry = Self::new();
        for (kind, command) in commands {
            registry.register(
                *kind,
                Arc::new(CommandExecutor::new(command.clone()).with_timeout(timeout_secs)),
            );
        }
        registry
    }

    pub fn register(&mut self, kind: PipelineKind, executor: Arc<dyn PipelineExecutor>) {
        self.executors.insert(kind, executor);
    }

    pub fn with(mut self, kind: PipelineKind, executor: Arc<dyn PipelineExecutor>) -> Self {
        self.register(kind, executor);
        self
    }

    pub fn get(&self, kind: PipelineKind) -> Option<Arc<dyn PipelineExecutor>> {
        self.executors.get(&kind).cloned()
    }

    pub fn kinds(&self) -> Vec<PipelineKind> {
        let mut kinds: Vec<_> = self.executors.keys().copied().collect();
        kinds.sort();
        kinds
    }
}

impl std::fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}
