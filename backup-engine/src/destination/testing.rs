//! In-memory destination with call counting and fault injection.

use super::{
    join_remote, ChunkTransfer, Destination, DestinationRecord, DirListing, DiskUsage, ReadSeek, RemoteEntry,
    UploadSession,
};
use crate::{EngineError, Result};
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::path::Path;
use std::rc::Rc;

#[derive(Default)]
pub struct MemoryState {
    pub files: BTreeMap<String, Vec<u8>>,
    pub dirs: BTreeSet<String>,
    parts: HashMap<String, Vec<u8>>,
    calls: HashMap<&'static str, usize>,
    failures: VecDeque<EngineError>,
    scheduled: Vec<(&'static str, usize, EngineError)>,
    /// Bytes accepted by `upload_chunk`, including re-sent ones.
    pub chunk_bytes: u64,
}

impl MemoryState {
    /// The next calls (of any operation) fail with these errors, in order.
    pub fn fail_next(&mut self, errors: Vec<EngineError>) {
        self.failures.extend(errors);
    }

    /// Call number `nth` (1-based, counted over the whole test) of `op` fails.
    pub fn fail_call(&mut self, op: &'static str, nth: usize, error: EngineError) {
        self.scheduled.push((op, nth, error));
    }

    pub fn calls(&self, op: &str) -> usize {
        self.calls.get(op).copied().unwrap_or(0)
    }

    fn enter(&mut self, op: &'static str) -> Result<()> {
        let n = {
            let count = self.calls.entry(op).or_default();
            *count += 1;
            *count
        };
        if let Some(pos) = self.scheduled.iter().position(|(o, at, _)| *o == op && *at == n) {
            return Err(self.scheduled.remove(pos).2);
        }
        match self.failures.pop_front() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn mkdirs(&mut self, path: &str) {
        let mut prefix = String::new();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            if !prefix.is_empty() {
                prefix.push('/');
            }
            prefix.push_str(segment);
            self.dirs.insert(prefix.clone());
        }
    }

    fn parent_of(path: &str) -> &str {
        path.rsplit_once('/').map(|(p, _)| p).unwrap_or("")
    }
}

pub struct MemoryDestination {
    record: DestinationRecord,
    state: Rc<RefCell<MemoryState>>,
}

impl MemoryDestination {
    pub fn new(id: &str) -> Self {
        Self {
            record: DestinationRecord::local(id, Path::new("/memory")),
            state: Rc::default(),
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        self.record.chunk_size = chunk_size;
        self
    }

    pub fn record_mut(&mut self) -> &mut DestinationRecord {
        &mut self.record
    }

    pub fn state(&self) -> Rc<RefCell<MemoryState>> {
        Rc::clone(&self.state)
    }

    fn key(path: &str) -> Result<String> {
        join_remote("", path)
    }
}

impl ChunkTransfer for MemoryDestination {
    fn prepare_upload(&mut self, path: &str, total_size: u64) -> Result<UploadSession> {
        let key = Self::key(path)?;
        let mut state = self.state.borrow_mut();
        state.enter("prepare_upload")?;
        state.parts.entry(key.clone()).or_default();
        Ok(UploadSession { remote_path: key.clone(), total_size, id: Some(format!("mem:{}", key)) })
    }

    fn upload_offset(&mut self, session: &UploadSession) -> Result<u64> {
        let mut state = self.state.borrow_mut();
        state.enter("upload_offset")?;
        Ok(match state.parts.get(&session.remote_path) {
            Some(part) => part.len() as u64,
            None if state.files.contains_key(&session.remote_path) => session.total_size,
            None => 0,
        })
    }

    fn upload_chunk(&mut self, session: &UploadSession, offset: u64, chunk: &[u8]) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.enter("upload_chunk")?;
        let part = state
            .parts
            .get_mut(&session.remote_path)
            .ok_or_else(|| EngineError::NotFound(session.remote_path.clone()))?;
        if (part.len() as u64) < offset {
            return Err(EngineError::Validation("gap in upload".into()));
        }
        part.truncate(offset as usize);
        part.extend_from_slice(chunk);
        state.chunk_bytes += chunk.len() as u64;
        Ok(())
    }

    fn finalize_upload(&mut self, session: &UploadSession, _source: &mut dyn ReadSeek) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.enter("finalize_upload")?;
        match state.parts.remove(&session.remote_path) {
            Some(part) if part.len() as u64 == session.total_size => {
                let parent = MemoryState::parent_of(&session.remote_path).to_string();
                state.mkdirs(&parent);
                state.files.insert(session.remote_path.clone(), part);
                Ok(())
            }
            Some(part) => {
                state.parts.insert(session.remote_path.clone(), part);
                Err(EngineError::Validation("incomplete upload".into()))
            }
            None if state.files.contains_key(&session.remote_path) => Ok(()),
            None => Err(EngineError::NotFound(session.remote_path.clone())),
        }
    }

    fn download_chunk(&mut self, path: &str, start: u64, end: u64) -> Result<Vec<u8>> {
        let key = Self::key(path)?;
        let mut state = self.state.borrow_mut();
        state.enter("download_chunk")?;
        let data = state.files.get(&key).ok_or_else(|| EngineError::NotFound(key.clone()))?;
        let end = (end as usize).min(data.len());
        let start = (start as usize).min(end);
        Ok(data[start..end].to_vec())
    }
}

impl Destination for MemoryDestination {
    fn record(&self) -> &DestinationRecord {
        &self.record
    }

    fn connect(&mut self) -> Result<()> {
        self.state.borrow_mut().enter("connect")
    }

    fn register(&mut self) -> Result<()> {
        self.state.borrow_mut().enter("register")
    }

    fn unregister(&mut self) -> Result<()> {
        self.state.borrow_mut().enter("unregister")
    }

    fn file_exists(&mut self, path: &str) -> Result<bool> {
        let key = Self::key(path)?;
        let mut state = self.state.borrow_mut();
        state.enter("file_exists")?;
        Ok(state.files.contains_key(&key))
    }

    fn dir_exists(&mut self, path: &str) -> Result<bool> {
        let key = Self::key(path)?;
        let mut state = self.state.borrow_mut();
        state.enter("dir_exists")?;
        Ok(key.is_empty() || state.dirs.contains(&key))
    }

    fn file_size(&mut self, path: &str) -> Result<u64> {
        let key = Self::key(path)?;
        let mut state = self.state.borrow_mut();
        state.enter("file_size")?;
        state
            .files
            .get(&key)
            .map(|d| d.len() as u64)
            .ok_or(EngineError::NotFound(key))
    }

    fn create_dir(&mut self, path: &str) -> Result<()> {
        let key = Self::key(path)?;
        let mut state = self.state.borrow_mut();
        state.enter("create_dir")?;
        state.mkdirs(&key);
        Ok(())
    }

    fn remove_dir(&mut self, path: &str) -> Result<()> {
        let key = Self::key(path)?;
        let prefix = format!("{}/", key);
        let mut state = self.state.borrow_mut();
        state.enter("remove_dir")?;
        state.dirs.retain(|d| d != &key && !d.starts_with(&prefix));
        state.files.retain(|f, _| !f.starts_with(&prefix));
        Ok(())
    }

    fn remove_file(&mut self, path: &str) -> Result<()> {
        let key = Self::key(path)?;
        let mut state = self.state.borrow_mut();
        state.enter("remove_file")?;
        state.files.remove(&key);
        Ok(())
    }

    fn list_dir(&mut self, path: &str) -> Result<DirListing> {
        let key = Self::key(path)?;
        let mut state = self.state.borrow_mut();
        state.enter("list_dir")?;
        if !key.is_empty() && !state.dirs.contains(&key) {
            return Err(EngineError::NotFound(key));
        }

        let child = |p: &str| MemoryState::parent_of(p) == key;
        let mut entries: Vec<RemoteEntry> = state
            .dirs
            .iter()
            .filter(|d| child(d.as_str()))
            .map(|d| RemoteEntry {
                name: d.rsplit('/').next().unwrap_or(d).to_string(),
                path: d.clone(),
                is_dir: true,
                size: 0,
                modified: None,
            })
            .collect();
        entries.extend(state.files.iter().filter(|(f, _)| child(f.as_str())).map(|(f, data)| RemoteEntry {
            name: f.rsplit('/').next().unwrap_or(f).to_string(),
            path: f.clone(),
            is_dir: false,
            size: data.len() as u64,
            modified: None,
        }));
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(Box::new(entries.into_iter()))
    }

    fn copy_to_remote(&mut self, local: &Path, path: &str) -> Result<()> {
        let key = Self::key(path)?;
        let data = std::fs::read(local)?;
        let mut state = self.state.borrow_mut();
        state.enter("copy_to_remote")?;
        let parent = MemoryState::parent_of(&key).to_string();
        state.mkdirs(&parent);
        state.files.insert(key, data);
        Ok(())
    }

    fn copy_to_local(&mut self, path: &str, local: &Path) -> Result<()> {
        let key = Self::key(path)?;
        let mut state = self.state.borrow_mut();
        state.enter("copy_to_local")?;
        let data = state.files.get(&key).ok_or_else(|| EngineError::NotFound(key.clone()))?;
        if let Some(parent) = local.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(local, data)?;
        Ok(())
    }

    fn disk_usage(&mut self) -> Result<Option<DiskUsage>> {
        let mut state = self.state.borrow_mut();
        state.enter("disk_usage")?;
        let used = state.files.values().map(|d| d.len() as u64).sum();
        Ok(Some(DiskUsage { used, total: None }))
    }
}
