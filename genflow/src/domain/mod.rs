//! Domain types shared across the orchestrator.

pub mod payload;
pub mod pipeline;
pub mod status;

pub use payload::TaskPayload;
pub use pipeline::{PipelineKind, Platform};
pub use status::{AccountHealth, FailureKind, ManagerState, TaskStatus};
