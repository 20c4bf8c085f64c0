//! The backup catalog: on-disk layout, control files, the file-list manifest,
//! parent/child incremental chains, and the instance/backup directory tree.

pub mod backup;
pub mod chain;
pub mod control_file;
pub mod instance;
pub mod manifest;
pub mod paths;

use std::collections::HashMap;
use std::path::Path;

use crate::errors::{BackupError, Result};
use crate::lock::{self, LockGuard, LockOutcome};

pub use backup::{Backup, BackupId, BackupMode, BackupStatus};
pub use chain::ChainState;
pub use manifest::{FileKind, FileRecord, BYTES_INVALID, FILE_NOT_FOUND};

/// Read-modify-write a backup's status: re-read the control file under an
/// exclusive lock, overwrite only the `status` field if it actually changed,
/// and rewrite atomically. Mirrors `write_backup_status`: silently returns if
/// the control file cannot currently be read (it's still being written).
/// # Errors
/// Returns an error if the lock cannot be acquired or the control file cannot
/// be written.
pub fn write_backup_status(catalog_root: &Path, instance: &str, id: BackupId, status: BackupStatus, strict: bool) -> Result<()> {
    let dir = paths::backup_dir(catalog_root, instance, id);
    let control_path = paths::control_file_path(&dir);

    let Some(mut current) = control_file::read(&control_path)? else {
        return Ok(());
    };
    if current.status == status {
        return Ok(());
    }

    let guard = match lock::acquire_exclusive(&dir, strict)? {
        LockOutcome::Acquired(guard) => Some(guard),
        LockOutcome::TreatedAsLocked => None,
        LockOutcome::Timeout => {
            return Err(BackupError::Lock(format!("cannot lock backup {id} directory")));
        }
    };

    current.status = status;
    control_file::write(&control_path, &current)?;
    drop(guard);
    Ok(())
}

/// Build an id→backup index over one instance's backups, for chain scans.
#[must_use]
pub fn index_by_id(backups: &[Backup]) -> HashMap<BackupId, &Backup> {
    backups.iter().map(|b| (b.id, b)).collect()
}

/// Resolve the parent for a new incremental backup on `timeline_id` (the
/// single-timeline case from §4.7): the latest OK/DONE FULL on the timeline,
/// then the latest OK/DONE descendant of that FULL whose chain is intact.
#[must_use]
pub fn last_data_backup<'a>(by_id: &HashMap<BackupId, &'a Backup>, backups: &[&'a Backup], timeline_id: u32) -> Option<&'a Backup> {
    let full = chain::latest_full_on_timeline(backups, timeline_id)?;
    Some(chain::latest_valid_descendant(by_id, backups, full).unwrap_or(full))
}

/// The ordered chain for a restore: oldest (FULL) → newest (target), or an
/// error describing why the chain cannot be used.
/// # Errors
/// Returns a [`BackupError::Catalog`] if the chain is broken or invalid.
pub fn resolve_restore_chain<'a>(by_id: &HashMap<BackupId, &'a Backup>, target: &'a Backup) -> Result<Vec<&'a Backup>> {
    let (mut chain, state) = chain::scan_parent_chain(by_id, target);
    match state {
        ChainState::Broken => Err(BackupError::Catalog(format!("backup {}: parent chain is broken", target.id))),
        ChainState::Invalid => Err(BackupError::Catalog(format!(
            "backup {}: parent chain contains a backup that is not OK/DONE",
            target.id
        ))),
        ChainState::Ok => {
            chain.reverse(); // scan_parent_chain returns newest→oldest; restore wants oldest→newest
            Ok(chain)
        }
    }
}

/// Lock a newest→oldest range of an instance's backup directories (by index
/// into `backups`, which must be sorted oldest-first as [`instance::list_backups`]
/// returns them). See §4.7/§5: chains are always locked in descending order so a
/// later backup is released before an earlier one it may depend on.
/// # Errors
/// Returns an error if any lock in the range cannot be acquired.
pub fn lock_backup_range(
    catalog_root: &Path,
    instance: &str,
    backups: &[Backup],
    from: usize,
    to: usize,
    strict: bool,
    exclusive: bool,
) -> Result<Vec<LockGuard>> {
    let dirs: Vec<_> = backups.iter().map(|b| paths::backup_dir(catalog_root, instance, b.id)).collect();
    lock::lock_backup_list(&dirs, from, to, strict, exclusive)
}

/// Delete one backup: lock it exclusively, mark DELETING, remove its
/// directory tree, mark DELETED. Children whose parent no longer resolves
/// become ORPHAN the next time the catalog is scanned; this function does not
/// cascade (§4.10: deleting a backup with children is the caller's decision,
/// made by including those children in its own `delete` call).
/// # Errors
/// Returns an error if the backup cannot be locked or its files cannot be removed.
pub fn delete_backup(catalog_root: &Path, instance: &str, id: BackupId, strict: bool) -> Result<()> {
    let dir = paths::backup_dir(catalog_root, instance, id);
    let guard = match lock::acquire_exclusive(&dir, strict)? {
        LockOutcome::Acquired(guard) => Some(guard),
        LockOutcome::TreatedAsLocked => None,
        LockOutcome::Timeout => return Err(BackupError::Lock(format!("cannot lock backup {id} for deletion"))),
    };

    if let Some(mut backup) = control_file::read(&paths::control_file_path(&dir))? {
        backup.status = BackupStatus::Deleting;
        control_file::write(&paths::control_file_path(&dir), &backup)?;
    }

    for entry in ["database", "external_directories"] {
        let path = dir.join(entry);
        if path.exists() {
            std::fs::remove_dir_all(&path)?;
        }
    }
    for entry in [paths::manifest_path(&dir), paths::header_map_path(&dir)] {
        if entry.exists() {
            std::fs::remove_file(&entry)?;
        }
    }
    if let Some(mut backup) = control_file::read(&paths::control_file_path(&dir))? {
        backup.status = BackupStatus::Deleted;
        control_file::write(&paths::control_file_path(&dir), &backup)?;
    }
    drop(guard);
    Ok(())
}

/// Read-modify-write a backup's `parent_backup` link, same discipline as
/// [`write_backup_status`]. Used when folding a backup into its parent during
/// merge: the folded backup's own children must be re-pointed at the
/// surviving parent before the folded backup is deleted.
/// # Errors
/// Returns an error if the lock cannot be acquired or the control file cannot
/// be written.
pub fn set_parent(catalog_root: &Path, instance: &str, id: BackupId, new_parent: Option<BackupId>, strict: bool) -> Result<()> {
    let dir = paths::backup_dir(catalog_root, instance, id);
    let control_path = paths::control_file_path(&dir);

    let Some(mut current) = control_file::read(&control_path)? else {
        return Ok(());
    };
    if current.parent_backup == new_parent {
        return Ok(());
    }

    let guard = match lock::acquire_exclusive(&dir, strict)? {
        LockOutcome::Acquired(guard) => Some(guard),
        LockOutcome::TreatedAsLocked => None,
        LockOutcome::Timeout => {
            return Err(BackupError::Lock(format!("cannot lock backup {id} directory")));
        }
    };

    current.parent_backup = new_parent;
    control_file::write(&control_path, &current)?;
    drop(guard);
    Ok(())
}

/// Find backups that reference a now-missing or non-OK parent and would need
/// to be marked ORPHAN on the next catalog scan. Pure bookkeeping: does not
/// write anything itself.
#[must_use]
pub fn orphaned_backups<'a>(by_id: &HashMap<BackupId, &'a Backup>, backups: &[&'a Backup]) -> Vec<&'a Backup> {
    backups
        .iter()
        .filter(|b| b.parent_backup.is_some())
        .filter(|b| !matches!(chain::scan_parent_chain(by_id, b).1, ChainState::Ok))
        .copied()
        .collect()
}
