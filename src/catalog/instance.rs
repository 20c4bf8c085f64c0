//! Enumerating instances and their backups.

use std::path::Path;

use crate::errors::Result;

use super::backup::Backup;
use super::control_file;
use super::paths;

/// List instance names: the subdirectories of `<catalog>/backups/`.
/// # Errors
/// Returns an error if the backups root cannot be listed.
pub fn list_instances(catalog_root: &Path) -> Result<Vec<String>> {
    let root = paths::instances_root(catalog_root);
    if !root.exists() {
        return Ok(Vec::new());
    }
    let mut names = Vec::new();
    for entry in std::fs::read_dir(&root)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
    }
    names.sort();
    Ok(names)
}

/// Enumerate every backup of `instance`, sorted oldest to newest by start
/// time. Backups whose control file is empty/not-yet-written are skipped
/// (treated as "still being created").
/// # Errors
/// Returns an error if the instance directory cannot be listed or a present
/// control file is malformed.
pub fn list_backups(catalog_root: &Path, instance: &str) -> Result<Vec<Backup>> {
    let instance_dir = paths::instance_dir(catalog_root, instance);
    if !instance_dir.exists() {
        return Ok(Vec::new());
    }
    let mut backups = Vec::new();
    for entry in std::fs::read_dir(&instance_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let control_path = paths::control_file_path(&entry.path());
        if !control_path.exists() {
            continue;
        }
        if let Some(backup) = control_file::read(&control_path)? {
            backups.push(backup);
        }
    }
    backups.sort_by_key(|b| b.start_time);
    Ok(backups)
}
