//! Filesystem destination (local disk, NAS mount).
//!
//! Chunked uploads write to a hidden `.<target>.bkpart` sibling; the
//! backend's offset is simply its length, and finalizing renames it into
//! place. Listings hide those temp files and nothing else.

use super::{
    join_remote, BackendOptions, ChunkTransfer, Destination, DestinationRecord, DirListing, DiskUsage, ReadSeek,
    RemoteEntry, UploadSession,
};
use crate::fs::{is_partial_name, partial_path as part_path};
use crate::{EngineError, Result};
use chrono::{DateTime, Utc};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

const REGISTRATION_FILE: &str = ".backup-destination";

pub struct LocalDestination {
    record: DestinationRecord,
    mount: PathBuf,
    root: PathBuf,
}

fn not_found(e: std::io::Error, what: &str) -> EngineError {
    if e.kind() == ErrorKind::NotFound {
        EngineError::NotFound(what.to_string())
    } else {
        EngineError::Io(e)
    }
}

fn ignore_missing(result: std::io::Result<()>) -> Result<()> {
    match result {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

impl LocalDestination {
    pub fn new(record: DestinationRecord) -> Result<Self> {
        let mount = match &record.backend {
            BackendOptions::Local { path } => path.clone(),
            _ => return Err(EngineError::Config(format!("destination '{}' is not local", record.id))),
        };
        let root = mount.join(join_remote("", &record.root)?);
        Ok(Self { record, mount, root })
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        let rel = join_remote("", path)?;
        Ok(if rel.is_empty() { self.root.clone() } else { self.root.join(rel) })
    }

    fn ensure_parent(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(())
    }
}

impl ChunkTransfer for LocalDestination {
    fn prepare_upload(&mut self, path: &str, total_size: u64) -> Result<UploadSession> {
        let target = self.resolve(path)?;
        Self::ensure_parent(&target)?;
        let part = part_path(&target);
        OpenOptions::new().create(true).append(true).open(&part)?;
        Ok(UploadSession {
            remote_path: path.to_string(),
            total_size,
            id: Some(part.to_string_lossy().into_owned()),
        })
    }

    fn upload_offset(&mut self, session: &UploadSession) -> Result<u64> {
        let target = self.resolve(&session.remote_path)?;
        match fs::metadata(part_path(&target)) {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == ErrorKind::NotFound => match fs::metadata(&target) {
                Ok(meta) if meta.len() == session.total_size => Ok(session.total_size),
                _ => Ok(0),
            },
            Err(e) => Err(e.into()),
        }
    }

    fn upload_chunk(&mut self, session: &UploadSession, offset: u64, chunk: &[u8]) -> Result<()> {
        let target = self.resolve(&session.remote_path)?;
        let mut part = OpenOptions::new().create(true).write(true).truncate(false).open(part_path(&target))?;
        let len = part.metadata()?.len();
        if len < offset {
            return Err(EngineError::Validation(format!(
                "{}: chunk at {} but only {} bytes stored",
                session.remote_path, offset, len
            )));
        }
        if len > offset {
            part.set_len(offset)?;
        }
        part.seek(SeekFrom::Start(offset))?;
        part.write_all(chunk)?;
        part.sync_data()?;
        Ok(())
    }

    fn finalize_upload(&mut self, session: &UploadSession, _source: &mut dyn ReadSeek) -> Result<()> {
        let target = self.resolve(&session.remote_path)?;
        let part = part_path(&target);
        match fs::metadata(&part) {
            Ok(meta) if meta.len() == session.total_size => {
                fs::rename(&part, &target)?;
                debug!("Finalized {}", target.display());
                Ok(())
            }
            Ok(meta) => Err(EngineError::Validation(format!(
                "{}: {} of {} bytes stored",
                session.remote_path,
                meta.len(),
                session.total_size
            ))),
            Err(e) if e.kind() == ErrorKind::NotFound => match fs::metadata(&target) {
                Ok(meta) if meta.len() == session.total_size => Ok(()),
                _ => Err(EngineError::NotFound(session.remote_path.clone())),
            },
            Err(e) => Err(e.into()),
        }
    }

    fn download_chunk(&mut self, path: &str, start: u64, end: u64) -> Result<Vec<u8>> {
        let mut file = File::open(self.resolve(path)?).map_err(|e| not_found(e, path))?;
        file.seek(SeekFrom::Start(start))?;
        let mut buf = Vec::with_capacity(end.saturating_sub(start) as usize);
        file.take(end.saturating_sub(start)).read_to_end(&mut buf)?;
        Ok(buf)
    }
}

impl Destination for LocalDestination {
    fn record(&self) -> &DestinationRecord {
        &self.record
    }

    fn connect(&mut self) -> Result<()> {
        if !self.mount.is_dir() {
            return Err(EngineError::NotFound(format!(
                "destination '{}': {} is not mounted",
                self.record.id,
                self.mount.display()
            )));
        }
        Ok(())
    }

    fn register(&mut self) -> Result<()> {
        fs::create_dir_all(&self.root)?;
        let marker = serde_json::json!({
            "id": self.record.id,
            "registered_at": Utc::now().to_rfc3339(),
        });
        fs::write(self.root.join(REGISTRATION_FILE), serde_json::to_vec_pretty(&marker)?)?;
        Ok(())
    }

    fn unregister(&mut self) -> Result<()> {
        ignore_missing(fs::remove_file(self.root.join(REGISTRATION_FILE)))
    }

    fn file_exists(&mut self, path: &str) -> Result<bool> {
        Ok(self.resolve(path)?.is_file())
    }

    fn dir_exists(&mut self, path: &str) -> Result<bool> {
        Ok(self.resolve(path)?.is_dir())
    }

    fn file_size(&mut self, path: &str) -> Result<u64> {
        let meta = fs::metadata(self.resolve(path)?).map_err(|e| not_found(e, path))?;
        Ok(meta.len())
    }

    fn create_dir(&mut self, path: &str) -> Result<()> {
        fs::create_dir_all(self.resolve(path)?)?;
        Ok(())
    }

    fn remove_dir(&mut self, path: &str) -> Result<()> {
        ignore_missing(fs::remove_dir_all(self.resolve(path)?))
    }

    fn remove_file(&mut self, path: &str) -> Result<()> {
        ignore_missing(fs::remove_file(self.resolve(path)?))
    }

    fn list_dir(&mut self, path: &str) -> Result<DirListing> {
        let dir = self.resolve(path)?;
        let base = join_remote("", path)?;
        let mut entries = Vec::new();
        for entry in fs::read_dir(&dir).map_err(|e| not_found(e, path))? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if (base.is_empty() && name == REGISTRATION_FILE) || is_partial_name(&name) {
                continue;
            }
            let meta = match entry.metadata() {
                Ok(meta) => meta,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            entries.push(RemoteEntry {
                path: join_remote(&base, &name)?,
                name,
                is_dir: meta.is_dir(),
                size: if meta.is_dir() { 0 } else { meta.len() },
                modified: meta.modified().ok().map(DateTime::<Utc>::from),
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(Box::new(entries.into_iter()))
    }

    fn copy_to_remote(&mut self, local: &Path, path: &str) -> Result<()> {
        let target = self.resolve(path)?;
        Self::ensure_parent(&target)?;
        let tmp = part_path(&target);
        fs::copy(local, &tmp)?;
        fs::rename(&tmp, &target)?;
        Ok(())
    }

    fn copy_to_local(&mut self, path: &str, local: &Path) -> Result<()> {
        Self::ensure_parent(local)?;
        fs::copy(self.resolve(path)?, local).map_err(|e| not_found(e, path))?;
        Ok(())
    }

    fn disk_usage(&mut self) -> Result<Option<DiskUsage>> {
        if !self.root.is_dir() {
            return Ok(Some(DiskUsage { used: 0, total: None }));
        }
        let mut used = 0;
        for entry in walkdir::WalkDir::new(&self.root) {
            let entry = entry.map_err(std::io::Error::from)?;
            if entry.file_type().is_file() {
                used += entry.metadata().map_err(std::io::Error::from)?.len();
            }
        }
        Ok(Some(DiskUsage { used, total: None }))
    }
}
