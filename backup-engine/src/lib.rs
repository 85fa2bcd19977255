//! Backup Engine Library
//!
//! Resumable backup and restore jobs: a persistent job queue, memoized
//! steps, durable manifests and chunked transfers to pluggable
//! destinations, all driven under a per-invocation time budget.

pub mod budget;
pub mod config;
pub mod database;
pub mod db;
pub mod destination;
pub mod drivers;
pub mod executor;
pub mod fs;
pub mod job;
pub mod transfer;
pub mod utils;
pub mod workspace;

// Re-export commonly used types
pub use config::Config;
pub use executor::worker::{RunOutcome, Worker};
pub use utils::{EngineError, Result};
