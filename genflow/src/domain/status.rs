//! Status enums shared by the queue, the account pool and the API.

use serde::{Deserialize, Serialize};

/// Task lifecycle status.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Waiting in its pipeline queue.
    Pending,
    /// Bound to an account and executing.
    Running,
    Succeeded,
    Failed,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 4] = [Self::Pending, Self::Running, Self::Succeeded, Self::Failed];

    /// Database representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "RUNNING" => Some(Self::Running),
            "SUCCEEDED" => Some(Self::Succeeded),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// Account health as seen by the pool.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum AccountHealth {
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
}

impl AccountHealth {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "unknown" => Some(Self::Unknown),
            "healthy" => Some(Self::Healthy),
            "unhealthy" => Some(Self::Unhealthy),
            _ => None,
        }
    }
}

/// Why a task ended up `failed`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Page load timeout or missing element on the platform site.
    WebInteraction,
    /// The platform never returned a generation task id.
    TaskIdNotObtained,
    /// The platform finished without producing an artifact.
    GenerationFailed,
    Other,
    /// Forced stop after the grace period.
    Cancelled,
    Timeout,
    /// No executor registered for the pipeline kind.
    NoExecutor,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WebInteraction => "web_interaction",
            Self::TaskIdNotObtained => "task_id_not_obtained",
            Self::GenerationFailed => "generation_failed",
            Self::Other => "other",
            Self::Cancelled => "cancelled",
            Self::Timeout => "timeout",
            Self::NoExecutor => "no_executor",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "web_interaction" => Some(Self::WebInteraction),
            "task_id_not_obtained" => Some(Self::TaskIdNotObtained),
            "generation_failed" => Some(Self::GenerationFailed),
            "other" => Some(Self::Other),
            "cancelled" => Some(Self::Cancelled),
            "timeout" => Some(Self::Timeout),
            "no_executor" => Some(Self::NoExecutor),
            _ => None,
        }
    }

    /// Map an executor result code (600/700/800/900 families) to a failure kind.
    pub fn from_code(code: i64) -> Self {
        match code {
            600..=699 => Self::WebInteraction,
            700..=799 => Self::TaskIdNotObtained,
            800..=899 => Self::GenerationFailed,
            _ => Self::Other,
        }
    }

    /// Whether the failure says something about the account rather than the run.
    pub fn counts_against_account(&self) -> bool {
        !matches!(self, Self::Cancelled | Self::NoExecutor)
    }
}

/// Cooperative control state of the task manager.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ManagerState {
    #[default]
    Stopped,
    Running,
    Paused,
}
