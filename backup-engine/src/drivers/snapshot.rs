//! Remote snapshot layout.
//!
//! ```text
//! {name}/files/...            site files
//! {name}/database.sql.zst     database dump, when one was taken
//! {name}/snapshot.json        written last; a snapshot without it is incomplete
//! ```

use crate::database::{DumpSummary, DUMP_FILE};
use crate::db::snapshots::Snapshot;
use crate::destination::Destination;
use crate::workspace::Workspace;
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

pub const MARKER_FILE: &str = "snapshot.json";
pub const FILES_DIR: &str = "files";

/// Names of generated snapshots; sorts chronologically.
pub const NAME_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMarker {
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub files: u64,
    pub bytes: u64,
    #[serde(default)]
    pub database: Option<DumpSummary>,
    #[serde(default)]
    pub manual: bool,
    #[serde(default)]
    pub job_id: Option<i64>,
}

impl SnapshotMarker {
    pub fn to_snapshot(&self, destination_id: &str) -> Snapshot {
        Snapshot {
            destination_id: destination_id.to_string(),
            name: self.name.clone(),
            created_at: self.created_at,
            files: self.files,
            bytes: self.bytes,
            has_database: self.database.is_some(),
            job_id: self.job_id,
        }
    }
}

pub fn marker_path(name: &str) -> String {
    format!("{}/{}", name, MARKER_FILE)
}

pub fn files_path(name: &str) -> String {
    format!("{}/{}", name, FILES_DIR)
}

pub fn dump_path(name: &str) -> String {
    format!("{}/{}", name, DUMP_FILE)
}

/// Fetch and parse `{name}/snapshot.json`. `None` when the snapshot has no
/// marker (an unfinished backup) or the marker is unreadable.
pub fn read_marker(dest: &mut dyn Destination, workspace: &Workspace, name: &str) -> Result<Option<SnapshotMarker>> {
    let remote = marker_path(name);
    if !dest.file_exists(&remote)? {
        return Ok(None);
    }
    let local = workspace.file(&format!("marker-{}.json", name));
    dest.copy_to_local(&remote, &local)?;
    let parsed = serde_json::from_slice::<SnapshotMarker>(&std::fs::read(&local)?);
    std::fs::remove_file(&local)?;
    match parsed {
        Ok(marker) => Ok(Some(marker)),
        Err(e) => {
            warn!("Ignoring unreadable marker {}: {}", remote, e);
            Ok(None)
        }
    }
}

/// Directories at the destination root, newest name first.
pub fn list_snapshot_dirs(dest: &mut dyn Destination) -> Result<Vec<String>> {
    let mut names: Vec<String> = dest.list_dir("")?.filter(|e| e.is_dir).map(|e| e.name).collect();
    names.sort_unstable_by(|a, b| b.cmp(a));
    Ok(names)
}
