//! Task manager: the supervisor owning the worker pool and the control surface.

mod health;
mod reaper;
mod service;

pub use health::{ComponentHealth, HealthReport, HealthStatus, SystemProbe};
pub use reaper::{reap_abandoned, spawn_reaper};
pub use service::{ManagerSummary, TaskManager, TaskManagerConfig};
