//! Directory traversal for manifest building.
//!
//! Entries are produced children-first (walkdir `contents_first`), so a
//! manifest written in walk order and consumed from its end yields every
//! directory before anything inside it.

use super::is_partial_name;
use std::cell::Cell;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tracing::warn;
use walkdir::{DirEntry, WalkDir};

/// Options for directory walking
#[derive(Debug, Clone)]
pub struct WalkOptions {
    /// Follow symbolic links
    pub follow_links: bool,

    /// Maximum depth (None = unlimited)
    pub max_depth: Option<usize>,

    /// Exclude globs. `*` and `?` stay within one path segment, `**` spans
    /// segments. A pattern without `/` is matched against the entry name,
    /// otherwise against the path relative to the root.
    pub exclude_patterns: Vec<String>,
}

impl Default for WalkOptions {
    fn default() -> Self {
        Self {
            follow_links: false,
            max_depth: None,
            exclude_patterns: default_excludes(),
        }
    }
}

pub fn default_excludes() -> Vec<String> {
    vec![
        ".git".to_string(),
        "node_modules".to_string(),
        ".DS_Store".to_string(),
    ]
}

/// Information about an entry discovered during walking
#[derive(Debug, Clone)]
pub struct FileInfo {
    /// Full path to the entry
    pub path: PathBuf,

    /// Relative path from the root, `/`-separated. Always valid UTF-8:
    /// entries whose names are not are skipped by [`walk`].
    pub relative_path: String,

    /// File size in bytes (0 for directories)
    pub size: u64,

    /// Modification time, unix seconds
    pub mtime: i64,

    pub is_dir: bool,
}

impl FileInfo {
    /// Symlinks resolve to their target. Returns None for symlinks to
    /// directories and broken links.
    fn from_entry(entry: &DirEntry, relative_path: String) -> std::io::Result<Option<Self>> {
        let raw = entry.metadata().map_err(std::io::Error::from)?;
        let metadata = if raw.is_symlink() {
            match std::fs::metadata(entry.path()) {
                Ok(resolved) if !resolved.is_dir() => resolved,
                _ => return Ok(None),
            }
        } else {
            raw
        };

        let mtime = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        let is_dir = metadata.is_dir();

        Ok(Some(Self {
            path: entry.path().to_path_buf(),
            relative_path,
            size: if is_dir { 0 } else { metadata.len() },
            mtime,
            is_dir,
        }))
    }
}

fn relative(path: &Path, root: &Path) -> String {
    let rel = path.strip_prefix(root).unwrap_or(path);
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// The relative path, or None when some component is not UTF-8.
fn relative_utf8(path: &Path, root: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).unwrap_or(path);
    let parts = rel.components().map(|c| c.as_os_str().to_str()).collect::<Option<Vec<_>>>()?;
    Some(parts.join("/"))
}

/// Walk `root` children-first, calling `callback` for every file and
/// directory below it (the root itself is not reported).
///
/// Entries that vanish mid-walk are skipped with a warning; any other error
/// stops the walk. Entries whose names are not valid UTF-8 are skipped with
/// a warning (directories with everything below them) and their number is
/// returned. In-flight partial files are never reported.
pub fn walk<F>(root: &Path, options: &WalkOptions, mut callback: F) -> std::io::Result<u64>
where
    F: FnMut(&FileInfo) -> std::io::Result<()>,
{
    let mut walker = WalkDir::new(root)
        .follow_links(options.follow_links)
        .contents_first(true)
        .min_depth(1);

    if let Some(max_depth) = options.max_depth {
        walker = walker.max_depth(max_depth);
    }

    let patterns = &options.exclude_patterns;
    let unreadable = Cell::new(0u64);
    let keep = |e: &DirEntry| {
        if should_exclude(e, root, patterns) {
            return false;
        }
        match e.file_name().to_str() {
            Some(name) => !is_partial_name(name),
            None => {
                warn!("Skipping {}: name is not valid UTF-8", e.path().display());
                unreadable.set(unreadable.get() + 1);
                false
            }
        }
    };
    for entry in walker.into_iter().filter_entry(keep) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) if e.io_error().map(|io| io.kind()) == Some(std::io::ErrorKind::NotFound) => {
                warn!("Skipping entry that vanished during walk: {}", e);
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        let Some(relative_path) = relative_utf8(entry.path(), root) else {
            warn!("Skipping {}: path is not valid UTF-8", entry.path().display());
            unreadable.set(unreadable.get() + 1);
            continue;
        };
        match FileInfo::from_entry(&entry, relative_path) {
            Ok(Some(info)) => callback(&info)?,
            Ok(None) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Skipping {}: vanished during walk", entry.path().display());
            }
            Err(e) => return Err(e),
        }
    }

    Ok(unreadable.get())
}

/// Check if a directory entry should be excluded based on patterns
fn should_exclude(entry: &DirEntry, root: &Path, patterns: &[String]) -> bool {
    if patterns.is_empty() {
        return false;
    }
    let file_name = entry.file_name().to_string_lossy();
    let rel = relative(entry.path(), root);

    patterns.iter().any(|pattern| {
        if pattern.contains('/') {
            glob_match(pattern.trim_start_matches('/'), &rel)
        } else {
            glob_match(pattern, &file_name)
        }
    })
}

/// Minimal glob matcher: `?` one char, `*` any run without `/`, `**` any run.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    match_from(&p, &t)
}

fn match_from(p: &[char], t: &[char]) -> bool {
    match p.first() {
        None => t.is_empty(),
        Some('*') if p.get(1) == Some(&'*') => {
            let rest = &p[2..];
            let rest = rest.strip_prefix(&['/']).filter(|r| !r.is_empty()).unwrap_or(rest);
            (0..=t.len()).any(|i| match_from(rest, &t[i..]))
        }
        Some('*') => {
            let rest = &p[1..];
            for i in 0..=t.len() {
                if match_from(rest, &t[i..]) {
                    return true;
                }
                if i < t.len() && t[i] == '/' {
                    break;
                }
            }
            false
        }
        Some('?') => !t.is_empty() && t[0] != '/' && match_from(&p[1..], &t[1..]),
        Some(c) => t.first() == Some(c) && match_from(&p[1..], &t[1..]),
    }
}
