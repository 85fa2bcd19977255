//! Backup destinations.
//!
//! A [`Destination`] is a remote (or local) store addressed by `/`-separated
//! paths relative to its root. Every destination also implements the
//! [`ChunkTransfer`] contract so large files move in resumable chunks.
//!
//! Backends form a closed set ([`BackendOptions`]); [`DestinationSet::open`]
//! builds one from its record and wraps it in [`Retrying`], so retry and the
//! read-only guard apply to every backend the same way.

pub mod drive;
pub mod local;
pub mod path_cache;
pub mod retry;
#[cfg(test)]
pub mod testing;

pub use retry::{RetryConfig, RetryPolicy, Retrying};

use crate::{EngineError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::io::{Read, Seek};
use std::path::{Path, PathBuf};

/// Chunks are 8 MiB unless the record says otherwise.
pub const DEFAULT_CHUNK_SIZE: u64 = 8 * 1024 * 1024;

pub trait ReadSeek: Read + Seek {}
impl<T: Read + Seek> ReadSeek for T {}

/// Handle for an upload in progress. Serializable so it can be memoized
/// and resumed by a later invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadSession {
    pub remote_path: String,
    pub total_size: u64,
    /// Backend session handle (a resumable-upload URL, for instance).
    #[serde(default)]
    pub id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteEntry {
    pub name: String,
    /// Full path relative to the destination root.
    pub path: String,
    pub is_dir: bool,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskUsage {
    pub used: u64,
    pub total: Option<u64>,
}

pub type DirListing = Box<dyn Iterator<Item = RemoteEntry>>;

/// Resumable chunked transfer.
///
/// Uploads: `prepare_upload` once, then `upload_offset` to learn how much the
/// backend already has, `upload_chunk` from there on, and `finalize_upload`
/// when every byte is sent. The offset is always asked of the backend, never
/// trusted from local state.
pub trait ChunkTransfer {
    fn prepare_upload(&mut self, path: &str, total_size: u64) -> Result<UploadSession>;

    fn upload_offset(&mut self, session: &UploadSession) -> Result<u64>;

    /// Backend-imposed chunk size, if any. Otherwise the record's size is used.
    fn chunk_size(&self) -> Option<u64> {
        None
    }

    fn upload_chunk(&mut self, session: &UploadSession, offset: u64, chunk: &[u8]) -> Result<()>;

    /// `source` is the complete local file, for backends that verify it.
    fn finalize_upload(&mut self, session: &UploadSession, source: &mut dyn ReadSeek) -> Result<()>;

    /// Bytes `start..end` (end exclusive) of a remote file.
    fn download_chunk(&mut self, path: &str, start: u64, end: u64) -> Result<Vec<u8>>;
}

pub trait Destination: ChunkTransfer {
    fn record(&self) -> &DestinationRecord;

    fn connect(&mut self) -> Result<()>;

    fn disconnect(&mut self) {}

    /// Create whatever the destination needs at its root.
    fn register(&mut self) -> Result<()>;

    fn unregister(&mut self) -> Result<()>;

    fn file_exists(&mut self, path: &str) -> Result<bool>;

    fn dir_exists(&mut self, path: &str) -> Result<bool>;

    /// [`EngineError::NotFound`] if missing.
    fn file_size(&mut self, path: &str) -> Result<u64>;

    /// Creates missing parents. Existing is fine.
    fn create_dir(&mut self, path: &str) -> Result<()>;

    /// Recursive. Missing is fine.
    fn remove_dir(&mut self, path: &str) -> Result<()>;

    /// Missing is fine.
    fn remove_file(&mut self, path: &str) -> Result<()>;

    fn list_dir(&mut self, path: &str) -> Result<DirListing>;

    /// Single-shot upload for small files. Overwrites.
    fn copy_to_remote(&mut self, local: &Path, path: &str) -> Result<()>;

    fn copy_to_local(&mut self, path: &str, local: &Path) -> Result<()>;

    fn disk_usage(&mut self) -> Result<Option<DiskUsage>>;

    fn effective_chunk_size(&self) -> u64 {
        self.chunk_size().unwrap_or(self.record().chunk_size).max(1)
    }
}

// ── Records ──

fn default_chunk_size() -> u64 {
    DEFAULT_CHUNK_SIZE
}

fn default_true() -> bool {
    true
}

/// A configured destination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestinationRecord {
    pub id: String,

    #[serde(default)]
    pub name: String,

    #[serde(flatten)]
    pub backend: BackendOptions,

    /// Sub-path under the backend's base that this destination owns.
    #[serde(default)]
    pub root: String,

    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,

    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub read_only: bool,

    #[serde(default)]
    pub is_default: bool,

    /// Overrides the global retry budget.
    #[serde(default)]
    pub max_tries: Option<u32>,
}

impl DestinationRecord {
    pub fn kind(&self) -> DestinationKind {
        match self.backend {
            BackendOptions::Local { .. } => DestinationKind::Local,
            BackendOptions::Drive(_) => DestinationKind::Drive,
        }
    }

    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }

    pub fn local(id: &str, path: &Path) -> Self {
        Self {
            id: id.to_string(),
            name: String::new(),
            backend: BackendOptions::Local { path: path.to_path_buf() },
            root: String::new(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            enabled: true,
            read_only: false,
            is_default: false,
            max_tries: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendOptions {
    Local { path: PathBuf },
    Drive(drive::DriveOptions),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DestinationKind {
    Local,
    Drive,
}

impl fmt::Display for DestinationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DestinationKind::Local => write!(f, "local"),
            DestinationKind::Drive => write!(f, "drive"),
        }
    }
}

/// Join destination-relative path segments, rejecting anything that could
/// escape the root.
pub fn join_remote(base: &str, rel: &str) -> Result<String> {
    let mut parts = Vec::new();
    for segment in base.split('/').chain(rel.split('/')) {
        match segment {
            "" | "." => {}
            ".." => {
                return Err(EngineError::Validation(format!(
                    "path escapes destination root: {}/{}",
                    base, rel
                )))
            }
            s => parts.push(s),
        }
    }
    Ok(parts.join("/"))
}

// ── Registry ──

/// The configured destinations plus the retry settings used to open them.
#[derive(Debug, Clone, Default)]
pub struct DestinationSet {
    records: Vec<DestinationRecord>,
    retry: RetryConfig,
}

impl DestinationSet {
    pub fn new(records: Vec<DestinationRecord>, retry: RetryConfig) -> Result<Self> {
        let set = Self { records, retry };
        set.validate()?;
        Ok(set)
    }

    fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for record in &self.records {
            if record.id.is_empty() || !seen.insert(record.id.as_str()) {
                return Err(EngineError::Config(format!(
                    "destination id '{}' is empty or duplicated",
                    record.id
                )));
            }
            if record.chunk_size == 0 {
                return Err(EngineError::Config(format!("destination '{}': chunk_size must be > 0", record.id)));
            }
            if let BackendOptions::Drive(options) = &record.backend {
                options.validate(record)?;
            }
        }

        let defaults: Vec<_> = self.records.iter().filter(|r| r.is_default).collect();
        if defaults.len() > 1 {
            return Err(EngineError::Config("more than one default destination".into()));
        }
        if let Some(default) = defaults.first() {
            if default.kind() != DestinationKind::Local {
                return Err(EngineError::Config(format!(
                    "default destination '{}' must be local",
                    default.id
                )));
            }
        }
        Ok(())
    }

    pub fn records(&self) -> &[DestinationRecord] {
        &self.records
    }

    pub fn get(&self, id: &str) -> Result<&DestinationRecord> {
        self.records
            .iter()
            .find(|r| r.id == id)
            .ok_or_else(|| EngineError::NotFound(format!("destination '{}'", id)))
    }

    pub fn default_record(&self) -> Option<&DestinationRecord> {
        self.records.iter().find(|r| r.is_default)
    }

    /// Enabled, writable destinations in configuration order.
    pub fn backup_targets(&self) -> Vec<String> {
        self.records
            .iter()
            .filter(|r| r.enabled && !r.read_only)
            .map(|r| r.id.clone())
            .collect()
    }

    pub fn open(&self, id: &str) -> Result<Box<dyn Destination>> {
        let record = self.get(id)?;
        if !record.enabled {
            return Err(EngineError::Validation(format!("destination '{}' is disabled", id)));
        }

        let mut policy = RetryPolicy::from_config(&self.retry);
        if let Some(tries) = record.max_tries {
            policy = policy.with_max_tries(tries);
        }

        let dest: Box<dyn Destination> = match &record.backend {
            BackendOptions::Local { .. } => Box::new(Retrying::new(local::LocalDestination::new(record.clone())?, policy)),
            BackendOptions::Drive(_) => Box::new(Retrying::new(drive::DriveDestination::new(record.clone())?, policy)),
        };
        Ok(dest)
    }
}
