//! Task queue: per-kind FIFO namespaces over the task table.

pub mod import;
mod service;
mod types;

pub use service::TaskQueue;
pub use types::{
    BatchOutcome, BulkCreateReport, EnqueueOutcome, FailedRow, QueueSnapshot, StatusCounts, Task,
    TaskPage, TaskResult,
};
