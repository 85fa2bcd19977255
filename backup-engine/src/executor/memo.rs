//! Step memoization store.
//!
//! An append-only `steps.jsonl` in the job workspace, one `{"key", "value"}`
//! record per completed step. Entries are write-once: a key that is already
//! present keeps its first value. A torn trailing line (crash mid-append) is
//! ignored on load.

use crate::Result;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const STEPS_FILE: &str = "steps.jsonl";

#[derive(Serialize, Deserialize)]
struct Record {
    key: String,
    value: Value,
}

pub struct StepStore {
    path: PathBuf,
    entries: HashMap<String, Value>,
    file: Option<File>,
    /// The file ends in a torn record; the next append starts a fresh line.
    torn_tail: bool,
}

impl StepStore {
    /// Load the store for a workspace directory. Nothing is created until the
    /// first [`StepStore::put`].
    pub fn open(dir: &Path) -> Result<Self> {
        let path = dir.join(STEPS_FILE);
        let mut entries = HashMap::new();
        let mut torn_tail = false;

        match std::fs::read_to_string(&path) {
            Ok(content) => {
                torn_tail = !content.is_empty() && !content.ends_with('\n');
                for (n, line) in content.lines().enumerate() {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<Record>(line) {
                        Ok(record) => {
                            entries.entry(record.key).or_insert(record.value);
                        }
                        Err(e) => warn!("Ignoring unreadable step record {} in {}: {}", n + 1, path.display(), e),
                    }
                }
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        debug!("Loaded {} memoized steps from {}", entries.len(), path.display());
        Ok(Self { path, entries, file: None, torn_tail })
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.entries.get(key) {
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
            None => Ok(None),
        }
    }

    /// Persist a completed step. Durable before returning.
    pub fn put<T: Serialize>(&mut self, key: &str, value: &T) -> Result<()> {
        if self.entries.contains_key(key) {
            debug!("Step '{}' already memoized, keeping first result", key);
            return Ok(());
        }

        let record = Record {
            key: key.to_string(),
            value: serde_json::to_value(value)?,
        };
        let mut line = String::new();
        if std::mem::take(&mut self.torn_tail) {
            line.push('\n');
        }
        line.push_str(&serde_json::to_string(&record)?);
        line.push('\n');

        let file = match &mut self.file {
            Some(file) => file,
            slot => {
                if let Some(parent) = self.path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                slot.insert(OpenOptions::new().create(true).append(true).open(&self.path)?)
            }
        };
        file.write_all(line.as_bytes())?;
        file.sync_data()?;

        self.entries.insert(record.key, record.value);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
