//! Repository layer for database access.

pub mod account;
pub mod settings;
pub mod task;

pub use account::{AccountRepository, SqlxAccountRepository};
pub use settings::{SettingsRepository, SqlxSettingsRepository};
pub use task::{SqlxTaskRepository, TaskRepository};
