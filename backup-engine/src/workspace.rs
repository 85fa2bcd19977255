//! Per-job scratch directory: `{data_dir}/{unique_id}/`.
//!
//! Holds the step store, manifests, dump cursors and the abort marker
//! `{unique_id}.abort`. Created lazily and removed when the job fails or
//! is aborted.

use crate::Result;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct Workspace {
    dir: PathBuf,
    unique_id: String,
}

impl Workspace {
    pub fn new(data_dir: &Path, unique_id: &str) -> Self {
        Self {
            dir: data_dir.join(unique_id),
            unique_id: unique_id.to_string(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn unique_id(&self) -> &str {
        &self.unique_id
    }

    pub fn exists(&self) -> bool {
        self.dir.is_dir()
    }

    pub fn ensure(&self) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        Ok(())
    }

    pub fn file(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    pub fn abort_marker(&self) -> PathBuf {
        self.dir.join(format!("{}.abort", self.unique_id))
    }

    pub fn signal_abort(&self) -> Result<()> {
        std::fs::write(self.abort_marker(), chrono::Utc::now().to_rfc3339())?;
        Ok(())
    }

    pub fn is_abort_signalled(&self) -> bool {
        self.abort_marker().exists()
    }

    pub fn clear_abort(&self) -> Result<()> {
        match std::fs::remove_file(self.abort_marker()) {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    /// Delete the whole directory. Missing is fine.
    pub fn remove(&self) -> Result<()> {
        match std::fs::remove_dir_all(&self.dir) {
            Ok(()) => {
                debug!("Removed workspace {}", self.dir.display());
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_abort_marker_lifecycle() -> crate::Result<()> {
        let data = TempDir::new()?;
        let ws = Workspace::new(data.path(), "abc");
        assert!(!ws.exists());
        ws.ensure()?;
        assert_eq!(ws.abort_marker(), data.path().join("abc").join("abc.abort"));

        ws.signal_abort()?;
        assert!(ws.is_abort_signalled());
        ws.clear_abort()?;
        ws.clear_abort()?;
        assert!(!ws.is_abort_signalled());

        ws.remove()?;
        ws.remove()?;
        assert!(!ws.exists());
        Ok(())
    }
}
