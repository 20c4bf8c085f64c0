//! Pluggable storage backend seam (§9 design note): every filesystem
//! operation the catalog, lock manager and file/restore engines perform goes
//! through a narrow trait instead of calling `std::fs` directly at the call
//! site, so a remote-agent transport could implement the same trait without
//! touching the algorithms above it. Only a local-filesystem implementation
//! ships here; the remote-agent transport itself is out of scope (§1).

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

/// One directory entry as `list` reports it.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub path: PathBuf,
    pub is_dir: bool,
}

/// Minimal file metadata `stat` needs to report.
#[derive(Debug, Clone, Copy)]
pub struct FileStat {
    pub len: u64,
    pub is_dir: bool,
}

/// Everything the catalog, lock manager, walker, and file/restore engines
/// need from wherever a backup's files actually live. `Send + Sync` so a
/// single backend instance can be shared across the per-file worker threads
/// described in §5.
pub trait StorageBackend: Send + Sync {
    /// Open a file for reading.
    /// # Errors
    /// Returns an error if the file cannot be opened.
    fn open_read(&self, path: &Path) -> io::Result<File>;

    /// Open a file for writing, creating it (and truncating an existing one)
    /// if needed.
    /// # Errors
    /// Returns an error if the file cannot be created/opened.
    fn open_write(&self, path: &Path) -> io::Result<File>;

    /// Metadata for `path`.
    /// # Errors
    /// Returns an error if `path` does not exist or cannot be inspected.
    fn stat(&self, path: &Path) -> io::Result<FileStat>;

    /// List the immediate children of a directory.
    /// # Errors
    /// Returns an error if `path` is not a readable directory.
    fn list(&self, path: &Path) -> io::Result<Vec<DirEntry>>;

    /// Remove a single file.
    /// # Errors
    /// Returns an error if the file does not exist or cannot be removed.
    fn remove(&self, path: &Path) -> io::Result<()>;

    /// Remove a directory and everything under it.
    /// # Errors
    /// Returns an error if the directory cannot be removed.
    fn remove_dir_all(&self, path: &Path) -> io::Result<()>;

    /// Rename/move `from` to `to`, overwriting `to` if it already exists.
    /// # Errors
    /// Returns an error if the rename fails.
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;

    /// Create a directory and any missing ancestors.
    /// # Errors
    /// Returns an error if the directory cannot be created.
    fn make_dir(&self, path: &Path) -> io::Result<()>;
}

/// The only backend this crate ships: plain `std::fs` calls against the
/// local filesystem. A remote-agent backend would implement the same trait
/// and could be swapped in at any call site that currently takes `&LocalFs`
/// by generic parameter or `&dyn StorageBackend`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFs;

impl StorageBackend for LocalFs {
    fn open_read(&self, path: &Path) -> io::Result<File> {
        File::open(path)
    }

    fn open_write(&self, path: &Path) -> io::Result<File> {
        std::fs::OpenOptions::new().write(true).create(true).truncate(true).open(path)
    }

    fn stat(&self, path: &Path) -> io::Result<FileStat> {
        let meta = std::fs::metadata(path)?;
        Ok(FileStat { len: meta.len(), is_dir: meta.is_dir() })
    }

    fn list(&self, path: &Path) -> io::Result<Vec<DirEntry>> {
        let mut out = Vec::new();
        for entry in std::fs::read_dir(path)? {
            let entry = entry?;
            out.push(DirEntry { path: entry.path(), is_dir: entry.file_type()?.is_dir() });
        }
        Ok(out)
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        std::fs::remove_file(path)
    }

    fn remove_dir_all(&self, path: &Path) -> io::Result<()> {
        std::fs::remove_dir_all(path)
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        std::fs::rename(from, to)
    }

    fn make_dir(&self, path: &Path) -> io::Result<()> {
        std::fs::create_dir_all(path)
    }
}
