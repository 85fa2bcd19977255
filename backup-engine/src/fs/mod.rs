pub mod walker;

use std::path::{Path, PathBuf};

/// Suffix of in-flight temp files, named `.<file name>.bkpart` next to their
/// target. Only names of that exact shape are treated as temp files.
pub const PARTIAL_SUFFIX: &str = ".bkpart";

/// Sibling temp path that `path` is written through before the final rename.
pub fn partial_path(path: &Path) -> PathBuf {
    let mut name = std::ffi::OsString::from(".");
    if let Some(file_name) = path.file_name() {
        name.push(file_name);
    }
    name.push(PARTIAL_SUFFIX);
    path.with_file_name(name)
}

pub fn is_partial_name(name: &str) -> bool {
    name.len() > 1 + PARTIAL_SUFFIX.len() && name.starts_with('.') && name.ends_with(PARTIAL_SUFFIX)
}
