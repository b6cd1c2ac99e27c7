//! REST API surface.
//!
//! Control of the task manager, per-pipeline task CRUD and downloads, account
//! pool management and runtime settings.

pub mod error;
pub mod routes;
pub mod server;

pub use error::{ApiError, ApiErrorResponse, ApiResult};
pub use server::{ApiServer, AppState};
