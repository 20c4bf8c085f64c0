//! Source-tree walking and per-file classification.

mod classify;

pub use classify::{
    ClassifiedFile, Fork, FsKind, classify_relative_path, parse_datafile_name,
};

use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::errors::Result;

/// Walk `root` and classify every regular file found under it, skipping
/// directories and files excluded by [`classify_relative_path`].
///
/// # Errors
/// Returns an error if the root cannot be read.
pub fn walk_source_tree(root: &Path) -> Result<Vec<ClassifiedFile>> {
    let mut out = Vec::new();
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.map_err(|e| {
            e.into_io_error().unwrap_or_else(|| std::io::Error::other(e.to_string()))
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry.path().strip_prefix(root).unwrap_or(entry.path());
        if let Some(classified) = classify_relative_path(rel) {
            out.push(classified);
        }
    }
    Ok(out)
}

/// Join a classified file's relative path back onto a root, for opening.
#[must_use]
pub fn resolve(root: &Path, file: &ClassifiedFile) -> PathBuf {
    root.join(&file.rel_path)
}
