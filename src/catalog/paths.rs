//! On-disk layout helpers: where things live under `<catalog>/`.

use std::path::{Path, PathBuf};

use super::backup::BackupId;

#[must_use]
pub fn instances_root(catalog_root: &Path) -> PathBuf {
    catalog_root.join("backups")
}

#[must_use]
pub fn instance_dir(catalog_root: &Path, instance: &str) -> PathBuf {
    instances_root(catalog_root).join(instance)
}

#[must_use]
pub fn instance_config_path(catalog_root: &Path, instance: &str) -> PathBuf {
    instance_dir(catalog_root, instance).join("pg_probackup.conf")
}

#[must_use]
pub fn wal_dir(catalog_root: &Path, instance: &str) -> PathBuf {
    catalog_root.join("wal").join(instance)
}

#[must_use]
pub fn backup_dir(catalog_root: &Path, instance: &str, id: BackupId) -> PathBuf {
    instance_dir(catalog_root, instance).join(id.to_string())
}

#[must_use]
pub fn control_file_path(backup_dir: &Path) -> PathBuf {
    backup_dir.join("backup.control")
}

#[must_use]
pub fn manifest_path(backup_dir: &Path) -> PathBuf {
    backup_dir.join("backup_content.control")
}

#[must_use]
pub fn header_map_path(backup_dir: &Path) -> PathBuf {
    backup_dir.join("page_header_map")
}

#[must_use]
pub fn exclusive_lock_path(backup_dir: &Path) -> PathBuf {
    backup_dir.join("backup.pid")
}

#[must_use]
pub fn shared_lock_path(backup_dir: &Path) -> PathBuf {
    backup_dir.join("backup_ro.pid")
}

#[must_use]
pub fn database_root(backup_dir: &Path) -> PathBuf {
    backup_dir.join("database")
}

#[must_use]
pub fn external_dirs_root(backup_dir: &Path) -> PathBuf {
    backup_dir.join("external_directories")
}

#[must_use]
pub fn log_dir(catalog_root: &Path, instance: &str) -> PathBuf {
    catalog_root.join("log").join(instance)
}
