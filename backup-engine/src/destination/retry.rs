//! Uniform retry for destination operations.
//!
//! Backends never retry on their own. [`Retrying`] wraps any backend and runs
//! every call through a [`RetryPolicy`]: transient failures (transport
//! errors, timeouts, HTTP 408/429/5xx gateway codes) are retried with
//! exponential backoff, anything else surfaces immediately.

use super::{DiskUsage, DirListing, ChunkTransfer, Destination, DestinationRecord, ReadSeek, UploadSession};
use crate::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::warn;

fn default_initial_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_max_tries() -> u32 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Total attempts, including the first.
    #[serde(default = "default_max_tries")]
    pub max_tries: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_tries: default_max_tries(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub max_tries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            max_tries: config.max_tries.max(1),
        }
    }

    pub fn with_max_tries(mut self, tries: u32) -> Self {
        self.max_tries = tries.max(1);
        self
    }

    /// Sleep before retry number `retry` (1-based): `initial * 2^(retry-1)`,
    /// capped at `max_delay`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.initial_delay.saturating_mul(factor).min(self.max_delay)
    }

    pub fn retry<T, F>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        let mut attempt = 1;
        loop {
            match op() {
                Ok(v) => return Ok(v),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) if attempt >= self.max_tries => {
                    return Err(EngineError::RetriesExhausted { tries: attempt, source: Box::new(e) });
                }
                Err(e) => {
                    let delay = self.delay_for(attempt);
                    warn!("{} failed (attempt {}/{}): {}; retrying in {:?}", what, attempt, self.max_tries, e, delay);
                    std::thread::sleep(delay);
                    attempt += 1;
                }
            }
        }
    }
}

/// A backend with the retry policy and the read-only guard applied.
pub struct Retrying<D> {
    inner: D,
    policy: RetryPolicy,
}

impl<D: Destination> Retrying<D> {
    pub fn new(inner: D, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &D {
        &self.inner
    }

    fn writable(&self) -> Result<()> {
        let record = self.inner.record();
        if record.read_only {
            return Err(EngineError::ReadOnly(record.id.clone()));
        }
        Ok(())
    }
}

impl<D: Destination> ChunkTransfer for Retrying<D> {
    fn prepare_upload(&mut self, path: &str, total_size: u64) -> Result<UploadSession> {
        self.writable()?;
        let inner = &mut self.inner;
        self.policy.retry("prepare upload", || inner.prepare_upload(path, total_size))
    }

    fn upload_offset(&mut self, session: &UploadSession) -> Result<u64> {
        let inner = &mut self.inner;
        self.policy.retry("query upload offset", || inner.upload_offset(session))
    }

    fn chunk_size(&self) -> Option<u64> {
        self.inner.chunk_size()
    }

    fn upload_chunk(&mut self, session: &UploadSession, offset: u64, chunk: &[u8]) -> Result<()> {
        self.writable()?;
        let inner = &mut self.inner;
        self.policy.retry("upload chunk", || inner.upload_chunk(session, offset, chunk))
    }

    fn finalize_upload(&mut self, session: &UploadSession, source: &mut dyn ReadSeek) -> Result<()> {
        self.writable()?;
        let inner = &mut self.inner;
        self.policy.retry("finalize upload", || inner.finalize_upload(session, &mut *source))
    }

    fn download_chunk(&mut self, path: &str, start: u64, end: u64) -> Result<Vec<u8>> {
        let inner = &mut self.inner;
        self.policy.retry("download chunk", || inner.download_chunk(path, start, end))
    }
}

impl<D: Destination> Destination for Retrying<D> {
    fn record(&self) -> &DestinationRecord {
        self.inner.record()
    }

    fn connect(&mut self) -> Result<()> {
        let inner = &mut self.inner;
        self.policy.retry("connect", || inner.connect())
    }

    fn disconnect(&mut self) {
        self.inner.disconnect()
    }

    fn register(&mut self) -> Result<()> {
        self.writable()?;
        let inner = &mut self.inner;
        self.policy.retry("register", || inner.register())
    }

    fn unregister(&mut self) -> Result<()> {
        self.writable()?;
        let inner = &mut self.inner;
        self.policy.retry("unregister", || inner.unregister())
    }

    fn file_exists(&mut self, path: &str) -> Result<bool> {
        let inner = &mut self.inner;
        self.policy.retry("file exists", || inner.file_exists(path))
    }

    fn dir_exists(&mut self, path: &str) -> Result<bool> {
        let inner = &mut self.inner;
        self.policy.retry("dir exists", || inner.dir_exists(path))
    }

    fn file_size(&mut self, path: &str) -> Result<u64> {
        let inner = &mut self.inner;
        self.policy.retry("file size", || inner.file_size(path))
    }

    fn create_dir(&mut self, path: &str) -> Result<()> {
        self.writable()?;
        let inner = &mut self.inner;
        self.policy.retry("create dir", || inner.create_dir(path))
    }

    fn remove_dir(&mut self, path: &str) -> Result<()> {
        self.writable()?;
        let inner = &mut self.inner;
        self.policy.retry("remove dir", || inner.remove_dir(path))
    }

    fn remove_file(&mut self, path: &str) -> Result<()> {
        self.writable()?;
        let inner = &mut self.inner;
        self.policy.retry("remove file", || inner.remove_file(path))
    }

    fn list_dir(&mut self, path: &str) -> Result<DirListing> {
        let inner = &mut self.inner;
        self.policy.retry("list dir", || inner.list_dir(path))
    }

    fn copy_to_remote(&mut self, local: &Path, path: &str) -> Result<()> {
        self.writable()?;
        let inner = &mut self.inner;
        self.policy.retry("copy to remote", || inner.copy_to_remote(local, path))
    }

    fn copy_to_local(&mut self, path: &str, local: &Path) -> Result<()> {
        let inner = &mut self.inner;
        self.policy.retry("copy to local", || inner.copy_to_local(path, local))
    }

    fn disk_usage(&mut self) -> Result<Option<DiskUsage>> {
        let inner = &mut self.inner;
        self.policy.retry("disk usage", || inner.disk_usage())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::destination::testing::MemoryDestination;
    use std::cell::Cell;

    fn fast(tries: u32) -> RetryPolicy {
        RetryPolicy {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            max_tries: tries,
        }
    }

    #[test]
    fn test_delay_schedule() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for(2), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(3), Duration::from_millis(2000));
        assert_eq!(policy.delay_for(7), Duration::from_secs(30));
        assert_eq!(policy.delay_for(60), Duration::from_secs(30));
    }

    #[test]
    fn test_transient_then_success() {
        let calls = Cell::new(0);
        let result = fast(5).retry("op", || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(EngineError::Http { status: 503, message: "busy".into() })
            } else {
                Ok(7)
            }
        });
        assert_eq!(result.ok(), Some(7));
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_fatal_is_not_retried() {
        let calls = Cell::new(0);
        let result: Result<()> = fast(5).retry("op", || {
            calls.set(calls.get() + 1);
            Err(EngineError::Http { status: 403, message: "forbidden".into() })
        });
        assert!(matches!(result, Err(EngineError::Http { status: 403, .. })));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_exhaustion() {
        let calls = Cell::new(0);
        let result: Result<()> = fast(3).retry("op", || {
            calls.set(calls.get() + 1);
            Err(EngineError::Transport("reset".into()))
        });
        match result {
            Err(EngineError::RetriesExhausted { tries, source }) => {
                assert_eq!(tries, 3);
                assert!(matches!(*source, EngineError::Transport(_)));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_wrapper_retries_backend_faults() -> Result<()> {
        let backend = MemoryDestination::new("mem");
        let state = backend.state();
        state.borrow_mut().fail_next(vec![
            EngineError::Transport("blip".into()),
            EngineError::Http { status: 429, message: "slow down".into() },
        ]);

        let mut dest = Retrying::new(backend, fast(5));
        dest.create_dir("a")?;
        assert!(dest.dir_exists("a")?);
        assert_eq!(state.borrow().calls("create_dir"), 3);
        Ok(())
    }

    #[test]
    fn test_read_only_guard() {
        let mut backend = MemoryDestination::new("mem");
        backend.record_mut().read_only = true;
        let state = backend.state();
        let mut dest = Retrying::new(backend, fast(5));

        assert!(matches!(dest.create_dir("a"), Err(EngineError::ReadOnly(_))));
        assert!(matches!(dest.prepare_upload("a", 10), Err(EngineError::ReadOnly(_))));
        assert_eq!(state.borrow().calls("create_dir"), 0);
        assert!(dest.file_exists("a").is_ok());

        // A session opened before the destination was made read-only.
        let session = UploadSession { remote_path: "a".into(), total_size: 10, id: None };
        assert!(matches!(dest.upload_chunk(&session, 0, &[0u8; 10]), Err(EngineError::ReadOnly(_))));
        let mut source = std::io::Cursor::new(vec![0u8; 10]);
        assert!(matches!(dest.finalize_upload(&session, &mut source), Err(EngineError::ReadOnly(_))));
        assert_eq!(state.borrow().calls("upload_chunk"), 0);
        assert_eq!(state.borrow().calls("finalize_upload"), 0);
    }
}
