//! Small filesystem helpers shared by the catalog, lock manager and config readers.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Create a file with restrictive permissions where supported.
///
/// On Unix, this maps to 0o600. On Windows, the default inherits ACLs; we just avoid
/// world-writable flags.
///
/// # Errors
/// Returns an error if the file cannot be created/opened.
pub fn create_secure(path: &Path) -> io::Result<File> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        OpenOptions::new().write(true).create(true).truncate(true).mode(0o600).open(path)
    }
    #[cfg(not(unix))]
    {
        OpenOptions::new().write(true).create(true).truncate(true).open(path)
    }
}

/// Open a file for read/write without truncation, creating it if absent.
///
/// # Errors
/// Returns an error if the file cannot be opened.
pub fn open_rw_no_trunc(path: &Path) -> io::Result<File> {
    OpenOptions::new().read(true).write(true).create(true).truncate(false).open(path)
}

/// Write `contents` to `path` atomically: write to a sibling temp file, `fsync`, then
/// `rename` over the destination. This is the write discipline every control file,
/// manifest and config file in the catalog uses.
///
/// # Errors
/// Returns an error if the temp file cannot be created/written/synced, or if the
/// rename fails.
pub fn atomic_write(path: &Path, contents: &[u8]) -> io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;
    let tmp_path = tmp_sibling(path);
    {
        let mut tmp = create_secure(&tmp_path)?;
        tmp.write_all(contents)?;
        tmp.sync_all()?;
    }
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

fn tmp_sibling(path: &Path) -> PathBuf {
    let file_name = path.file_name().and_then(|s| s.to_str()).unwrap_or("tmp");
    let pid = std::process::id();
    path.with_file_name(format!(".{file_name}.{pid}.tmp"))
}
