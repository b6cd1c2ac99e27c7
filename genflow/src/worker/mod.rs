//! Worker pool: per-kind execution units under a global concurrency cap.

mod pool;
mod slots;

pub use pool::{WorkerDeps, WorkerPool, WorkerPoolConfig};
pub use slots::{SlotRegistry, SlotState, ThreadInfo, unit_id};
