//! SQLite storage shared by the job queue and the snapshot index.

pub mod connection;
pub mod migrate;
pub mod snapshots;

pub use connection::{create_pool, DbPool};
