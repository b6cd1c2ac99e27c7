//! Database models for genflow.
//!
//! These models map directly to the database schema.

pub mod account;
pub mod settings;
pub mod task;

pub use account::*;
pub use settings::*;
pub use task::*;
