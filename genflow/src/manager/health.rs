//! Health reporting for the task manager.

use serde::Serialize;
use std::time::Duration;
use sysinfo::{CpuRefreshKind, MemoryRefreshKind, RefreshKind, System};
use tokio::sync::Mutex;

use crate::domain::ManagerState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    /// Still serving, but something needs attention.
    Degraded,
    Unhealthy,
}

/// One probe result, e.g. `repository` or `workers`.
#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub name: &'static str,
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Epoch milliseconds.
    pub checked_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed_ms: Option<u64>,
}

impl ComponentHealth {
    fn checked(name: &'static str, status: HealthStatus, message: Option<String>) -> Self {
        Self {
            name,
            status,
            message,
            checked_at: chrono::Utc::now().timestamp_millis(),
            elapsed_ms: None,
        }
    }

    pub fn healthy(name: &'static str) -> Self {
        Self::checked(name, HealthStatus::Healthy, None)
    }

    pub fn degraded(name: &'static str, message: impl Into<String>) -> Self {
        Self::checked(name, HealthStatus::Degraded, Some(message.into()))
    }

    pub fn unhealthy(name: &'static str, message: impl Into<String>) -> Self {
        Self::checked(name, HealthStatus::Unhealthy, Some(message.into()))
    }

    pub fn with_message(self, message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..self
        }
    }

    pub fn with_duration(self, elapsed: Duration) -> Self {
        Self {
            elapsed_ms: Some(elapsed.as_millis() as u64),
            ..self
        }
    }

    fn summary(&self) -> String {
        match &self.message {
            Some(message) => format!("{}: {}", self.name, message),
            None => self.name.to_string(),
        }
    }
}

/// Health of the whole orchestrator.
///
/// Any unhealthy or degraded component makes the report `Degraded`; the
/// first such component's message becomes the reason.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub state: ManagerState,
    pub components: Vec<ComponentHealth>,
    pub version: String,
    pub uptime_secs: u64,
    pub timestamp: i64,
    /// CPU usage percentage (0-100).
    pub cpu_usage: f32,
    /// Memory usage percentage (0-100).
    pub memory_usage: f32,
}

impl HealthReport {
    pub fn from_components(
        state: ManagerState,
        components: Vec<ComponentHealth>,
        uptime: Duration,
        (cpu_usage, memory_usage): (f32, f32),
    ) -> Self {
        let reason = components
            .iter()
            .find(|c| c.status != HealthStatus::Healthy)
            .map(ComponentHealth::summary);
        let status = if reason.is_some() {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };
        Self {
            status,
            reason,
            state,
            components,
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_secs: uptime.as_secs(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            cpu_usage,
            memory_usage,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

/// Host CPU and memory sampler.
pub struct SystemProbe {
    system: Mutex<System>,
}

impl SystemProbe {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new_with_specifics(
                RefreshKind::nothing()
                    .with_cpu(CpuRefreshKind::everything())
                    .with_memory(MemoryRefreshKind::everything()),
            )),
        }
    }

    /// `(cpu %, memory %)`.
    pub async fn sample(&self) -> (f32, f32) {
        let mut system = self.system.lock().await;
        system.refresh_cpu_all();
        system.refresh_memory();
        let memory = match system.total_memory() {
            0 => 0.0,
            total => (system.used_memory() as f64 * 100.0 / total as f64) as f32,
        };
        (system.global_cpu_usage(), memory)
    }
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new()
    }
}
