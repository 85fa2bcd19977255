//! Error types for the backup engine.
//!
//! Suspension under the time budget is not an error (see [`crate::budget::Flow`]);
//! everything here is a genuine fault.

use thiserror::Error;

/// HTTP statuses that are worth another attempt.
pub const RETRYABLE_HTTP_STATUSES: &[u16] = &[408, 429, 500, 502, 503, 504];

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// A response arrived but could not be understood. Asking again gets
    /// the same answer.
    #[error("Malformed response: {0}")]
    Decode(String),

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("A {job_type} job for target '{target_id}' is already active")]
    DuplicateJob { job_type: String, target_id: String },

    #[error("Job {0} not found")]
    JobNotFound(i64),

    #[error("Job {job_id} cannot move from status {from} to {to}")]
    StatusRegression { job_id: i64, from: i64, to: i64 },

    #[error("Job {0} has no workspace yet")]
    NotStarted(i64),

    #[error("No driver for job type '{0}'")]
    UnsupportedJob(String),

    #[error("Destination '{0}' is read-only")]
    ReadOnly(String),

    #[error("Gave up after {tries} attempts: {source}")]
    RetriesExhausted {
        tries: u32,
        #[source]
        source: Box<EngineError>,
    },

    #[error("Too many failed items ({0})")]
    TooManyItemErrors(u32),

    #[error("Every destination failed ({0})")]
    AllDestinationsFailed(usize),

    #[error("Compression error: {0}")]
    Compression(String),
}

impl EngineError {
    /// Transient failures that a retry may cure.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::Transport(_) => true,
            EngineError::Http { status, .. } => RETRYABLE_HTTP_STATUSES.contains(status),
            EngineError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }

    /// The item disappeared between listing and processing.
    pub fn is_vanished(&self) -> bool {
        match self {
            EngineError::NotFound(_) => true,
            EngineError::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }

    /// Errors that must stop a job even when raised for a single item.
    pub fn is_fatal_for_job(&self) -> bool {
        match self {
            EngineError::Authentication(_) | EngineError::ReadOnly(_) => true,
            EngineError::RetriesExhausted { source, .. } => source.is_fatal_for_job(),
            _ => false,
        }
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(e: reqwest::Error) -> Self {
        client_error(e.status().map(|s| s.as_u16()), e.is_decode(), e.to_string())
    }
}

fn client_error(status: Option<u16>, decode: bool, message: String) -> EngineError {
    if decode {
        return EngineError::Decode(message);
    }
    match status {
        Some(status) => EngineError::Http { status, message },
        None => EngineError::Transport(message),
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
