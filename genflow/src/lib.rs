//! genflow library crate.
//!
//! A task orchestrator for multi-pipeline content generation: durable per-kind
//! FIFO queues, a pooled set of platform accounts, a bounded worker pool and
//! a global start/pause/resume/stop control surface.

pub mod accounts;
pub mod api;
pub mod artifacts;
pub mod config;
pub mod database;
pub mod domain;
pub mod error;
pub mod executor;
pub mod logging;
pub mod manager;
pub mod queue;
pub mod worker;

pub use error::{Error, Result};
