//! Durable work manifest.
//!
//! A manifest is a text file with one entry per line:
//!
//! ```text
//! kind size mtime relative/path with spaces
//! ```
//!
//! `kind` is `f` or `d`. The path is the last field and may contain spaces.
//! Work is consumed from the END of the file: [`Manifest::peek`] reads the
//! last line, the caller processes it, then [`Manifest::commit`] truncates it
//! away and syncs. A crash before the commit replays the entry, so work items
//! must be idempotent. Reading the tail never loads the whole file.

use crate::fs::walker::{self, WalkOptions};
use crate::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Tail scans read the file backwards in blocks of this size.
pub const BLOCK_SIZE: u64 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    File,
    Dir,
}

impl EntryKind {
    fn tag(self) -> char {
        match self {
            EntryKind::File => 'f',
            EntryKind::Dir => 'd',
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub kind: EntryKind,
    pub size: u64,
    pub mtime: i64,
    pub path: String,
}

impl ManifestEntry {
    pub fn file(path: &str, size: u64, mtime: i64) -> Self {
        Self { kind: EntryKind::File, size, mtime, path: path.to_string() }
    }

    pub fn dir(path: &str, mtime: i64) -> Self {
        Self { kind: EntryKind::Dir, size: 0, mtime, path: path.to_string() }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Dir
    }

    pub fn parse(line: &str) -> Result<Self> {
        let bad = || EngineError::Validation(format!("malformed manifest line: {:?}", line));
        let mut fields = line.splitn(4, ' ');
        let kind = match fields.next() {
            Some("f") => EntryKind::File,
            Some("d") => EntryKind::Dir,
            _ => return Err(bad()),
        };
        let size = fields.next().and_then(|s| s.parse().ok()).ok_or_else(bad)?;
        let mtime = fields.next().and_then(|s| s.parse().ok()).ok_or_else(bad)?;
        let path = fields.next().filter(|p| !p.is_empty()).ok_or_else(bad)?;
        Ok(Self { kind, size, mtime, path: path.to_string() })
    }
}

impl fmt::Display for ManifestEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {} {}", self.kind.tag(), self.size, self.mtime, self.path)
    }
}

/// Entry count and file bytes of a freshly built manifest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestSummary {
    pub entries: u64,
    pub files: u64,
    pub bytes: u64,
    /// Entries left out because their names cannot be stored on a line.
    #[serde(default)]
    pub skipped: u64,
}

impl ManifestSummary {
    fn add(&mut self, entry: &ManifestEntry) {
        self.entries += 1;
        if !entry.is_dir() {
            self.files += 1;
        }
        self.bytes += entry.size;
    }
}

/// Writes a manifest to `<path>.tmp` and renames it into place on finish,
/// so a half-written manifest is never consumed.
pub struct ManifestWriter {
    out: BufWriter<File>,
    tmp: PathBuf,
    path: PathBuf,
    summary: ManifestSummary,
}

impl ManifestWriter {
    pub fn create(path: &Path) -> Result<Self> {
        let tmp = tmp_path(path);
        let out = BufWriter::new(File::create(&tmp)?);
        Ok(Self { out, tmp, path: path.to_path_buf(), summary: ManifestSummary::default() })
    }

    /// Append an entry. A path containing a newline is left out with a
    /// warning and counted in [`ManifestSummary::skipped`].
    pub fn push(&mut self, entry: &ManifestEntry) -> Result<()> {
        if entry.path.contains('\n') {
            warn!("Skipping {:?}: path contains a newline", entry.path);
            self.summary.skipped += 1;
            return Ok(());
        }
        writeln!(self.out, "{}", entry)?;
        self.summary.add(entry);
        Ok(())
    }

    pub fn finish(self) -> Result<ManifestSummary> {
        let file = self.out.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        drop(file);
        std::fs::rename(&self.tmp, &self.path)?;
        Ok(self.summary)
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Walk `root` and write its manifest to `path`.
///
/// If `path` already exists (an earlier invocation built it but died before
/// recording the step) its remaining entries are summarized instead.
pub fn build(path: &Path, root: &Path, options: &WalkOptions) -> Result<ManifestSummary> {
    if path.exists() {
        debug!("Manifest {} already present, summarizing", path.display());
        return summarize(path);
    }

    let mut writer = ManifestWriter::create(path)?;
    let mut failed = None;
    let unreadable = walker::walk(root, options, |info| {
        let entry = if info.is_dir {
            ManifestEntry::dir(&info.relative_path, info.mtime)
        } else {
            ManifestEntry::file(&info.relative_path, info.size, info.mtime)
        };
        if let Err(e) = writer.push(&entry) {
            failed = Some(e);
            return Err(std::io::Error::other("manifest write failed"));
        }
        Ok(())
    })
    .map_err(|e| failed.take().unwrap_or(EngineError::Io(e)))?;

    let mut summary = writer.finish()?;
    summary.skipped += unreadable;
    info!(
        "Built manifest {} ({} entries, {} bytes, {} skipped)",
        path.display(),
        summary.entries,
        summary.bytes,
        summary.skipped
    );
    Ok(summary)
}

/// Count what is left in a manifest.
pub fn summarize(path: &Path) -> Result<ManifestSummary> {
    let mut summary = ManifestSummary::default();
    for line in BufReader::new(File::open(path)?).lines() {
        let line = line?;
        if line.is_empty() {
            continue;
        }
        summary.add(&ManifestEntry::parse(&line)?);
    }
    Ok(summary)
}

/// The last entry of a manifest, not yet removed.
#[derive(Debug)]
pub struct Pending {
    pub entry: ManifestEntry,
    line_start: u64,
}

/// An open manifest being consumed from its tail.
pub struct Manifest {
    path: PathBuf,
    file: File,
}

impl Manifest {
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self { path: path.to_path_buf(), file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len_bytes(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len_bytes()? == 0)
    }

    /// Read the last entry without removing it. Blank trailing lines are
    /// dropped on the way.
    pub fn peek(&mut self) -> Result<Option<Pending>> {
        loop {
            let len = self.len_bytes()?;
            if len == 0 {
                return Ok(None);
            }

            let content_end = if self.byte_at(len - 1)? == b'\n' { len - 1 } else { len };
            let line_start = self.find_line_start(content_end)?;

            if line_start == content_end {
                self.truncate(line_start)?;
                continue;
            }

            let mut buf = vec![0u8; (content_end - line_start) as usize];
            self.file.seek(SeekFrom::Start(line_start))?;
            self.file.read_exact(&mut buf)?;
            let line = String::from_utf8(buf)
                .map_err(|_| EngineError::Validation(format!("non-UTF-8 line in {}", self.path.display())))?;

            return Ok(Some(Pending { entry: ManifestEntry::parse(&line)?, line_start }));
        }
    }

    /// Drop the entry returned by the last [`Manifest::peek`].
    pub fn commit(&mut self, pending: Pending) -> Result<()> {
        self.truncate(pending.line_start)
    }

    fn truncate(&mut self, len: u64) -> Result<()> {
        self.file.set_len(len)?;
        self.file.sync_data()?;
        Ok(())
    }

    fn byte_at(&mut self, pos: u64) -> Result<u8> {
        let mut b = [0u8; 1];
        self.file.seek(SeekFrom::Start(pos))?;
        self.file.read_exact(&mut b)?;
        Ok(b[0])
    }

    /// Offset just past the last `\n` before `end`, or 0.
    fn find_line_start(&mut self, end: u64) -> Result<u64> {
        let mut pos = end;
        let mut block = vec![0u8; BLOCK_SIZE as usize];
        while pos > 0 {
            let start = pos.saturating_sub(BLOCK_SIZE);
            let chunk = &mut block[..(pos - start) as usize];
            self.file.seek(SeekFrom::Start(start))?;
            self.file.read_exact(chunk)?;
            if let Some(i) = chunk.iter().rposition(|&b| b == b'\n') {
                return Ok(start + i as u64 + 1);
            }
            pos = start;
        }
        Ok(0)
    }
}
