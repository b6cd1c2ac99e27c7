//! API route modules.
//!
//! Organizes routes by resource type.

pub mod accounts;
pub mod health;
pub mod settings;
pub mod task_manager;
pub mod tasks;

use axum::Router;

use crate::api::server::AppState;

/// Create the main API router with all routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .nest("/api/task-manager", task_manager::router())
        .nest("/api/tasks/{kind}", tasks::router())
        .nest("/api/accounts/{platform}", accounts::router())
        .nest("/api/settings", settings::router())
        .nest("/health", health::router())
        .with_state(state)
}
