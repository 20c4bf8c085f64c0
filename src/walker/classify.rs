//! Filename grammar and exclusion tables for the source-tree walker.

use std::path::{Component, Path, PathBuf};

const EXCLUDE_FILE_NAMES: &[&str] = &[
    "postmaster.pid",
    "postmaster.opts",
    "recovery.conf",
    "postgresql.auto.conf.tmp",
    "current_logfiles.tmp",
    "probackup_recovery.conf",
    "recovery.signal",
    "standby.signal",
];

/// Additionally excluded only when the backup is non-exclusive (concurrent) mode.
const EXCLUDE_FILE_NAMES_NON_EXCLUSIVE: &[&str] = &["backup_label", "tablespace_map"];

const EXCLUDE_DIR_NAMES: &[&str] = &[
    "pg_xlog",
    "pg_wal",
    "pg_stat_tmp",
    "pgsql_tmp",
    "pg_replslot",
    "pg_dynshmem",
    "pg_notify",
    "pg_serial",
    "pg_snapshots",
    "pg_subtrans",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsKind {
    Regular,
    Directory,
    Symlink,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fork {
    None,
    Vm,
    Fsm,
    Cfm,
    Ptrack,
    Init,
}

impl Fork {
    #[must_use]
    pub fn parse(suffix: &str) -> Option<Self> {
        match suffix {
            "vm" => Some(Self::Vm),
            "fsm" => Some(Self::Fsm),
            "cfm" => Some(Self::Cfm),
            "ptrack" => Some(Self::Ptrack),
            "init" => Some(Self::Init),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifiedFile {
    pub rel_path: PathBuf,
    pub kind: FsKind,
    pub is_datafile: bool,
    pub is_cfs: bool,
    pub fork: Fork,
    pub rel_oid: Option<u32>,
    pub segno: Option<u32>,
    pub db_oid: Option<u32>,
    pub tablespace_oid: Option<u32>,
}

/// Parse a datafile basename of the form `relOid[.segno][_fork]`.
///
/// Returns `None` if the basename does not start with a digit, or if more than
/// two numeric components are present (more than `relOid.segno`).
#[must_use]
pub fn parse_datafile_name(basename: &str) -> Option<(u32, Option<u32>, Fork)> {
    if !basename.starts_with(|c: char| c.is_ascii_digit()) {
        return None;
    }
    let (numeric_part, fork) = match basename.rsplit_once('_') {
        Some((head, suffix)) => match Fork::parse(suffix) {
            Some(fork) => (head, fork),
            None => (basename, Fork::None),
        },
        None => (basename, Fork::None),
    };

    let mut parts = numeric_part.split('.');
    let rel_oid: u32 = parts.next()?.parse().ok()?;
    let segno = match parts.next() {
        Some(s) => Some(s.parse().ok()?),
        None => None,
    };
    if parts.next().is_some() {
        return None;
    }
    Some((rel_oid, segno, fork))
}

/// Is `name` a per-database temp file (`t<digits>...`)?
fn is_temp_relation_file(name: &str) -> bool {
    name.starts_with('t') && name[1..].starts_with(|c: char| c.is_ascii_digit())
}

/// Classify one relative path. Returns `None` if the path should be entirely
/// excluded from the backup.
#[must_use]
pub fn classify_relative_path(rel_path: &Path) -> Option<ClassifiedFile> {
    let file_name = rel_path.file_name()?.to_str()?;

    if EXCLUDE_FILE_NAMES.contains(&file_name) || EXCLUDE_FILE_NAMES_NON_EXCLUSIVE.contains(&file_name) {
        return None;
    }

    let mut tablespace_oid = None;
    let mut db_oid = None;
    let mut in_datafile_zone = false;
    let components: Vec<&str> = rel_path
        .components()
        .filter_map(|c| match c {
            Component::Normal(s) => s.to_str(),
            _ => None,
        })
        .collect();

    for (idx, part) in components.iter().enumerate() {
        if EXCLUDE_DIR_NAMES.contains(part) {
            return None;
        }
        if *part == "pg_tblspc" {
            if let Some(oid_str) = components.get(idx + 1) {
                tablespace_oid = oid_str.parse().ok();
            }
            // The version directory (one further down) marks the database root;
            // everything under it is eligible for datafile classification.
            if components.len() > idx + 2 {
                in_datafile_zone = true;
            }
        }
        if *part == "base" {
            if let Some(oid_str) = components.get(idx + 1) {
                db_oid = oid_str.parse().ok();
            }
            in_datafile_zone = true;
        }
    }

    if is_temp_relation_file(file_name) {
        return None;
    }
    if file_name == "pg_filenode.map" || file_name == "pg_filenode.map.tmp" {
        return None;
    }
    if file_name.starts_with("ptrack") && (file_name.ends_with(".map") || file_name.ends_with(".map.tmp")) {
        return None;
    }

    let (is_datafile, fork, rel_oid, segno, is_cfs) = if in_datafile_zone {
        match parse_datafile_name(file_name) {
            Some((_, _, Fork::Ptrack)) => return None,
            Some((rel_oid, segno, fork)) => {
                (true, fork, Some(rel_oid), segno, fork == Fork::Cfm)
            }
            None => (false, Fork::None, None, None, false),
        }
    } else {
        (false, Fork::None, None, None, false)
    };

    Some(ClassifiedFile {
        rel_path: rel_path.to_path_buf(),
        kind: FsKind::Regular,
        is_datafile,
        is_cfs,
        fork,
        rel_oid,
        segno,
        db_oid,
        tablespace_oid,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_rel_oid() {
        assert_eq!(parse_datafile_name("16384"), Some((16384, None, Fork::None)));
    }

    #[test]
    fn parses_rel_oid_with_segno() {
        assert_eq!(parse_datafile_name("16384.3"), Some((16384, Some(3), Fork::None)));
    }

    #[test]
    fn parses_rel_oid_with_fork() {
        assert_eq!(parse_datafile_name("16384_vm"), Some((16384, None, Fork::Vm)));
        assert_eq!(parse_datafile_name("16384_fsm"), Some((16384, None, Fork::Fsm)));
    }

    #[test]
    fn parses_rel_oid_with_segno_and_fork() {
        assert_eq!(parse_datafile_name("16384.2_init"), Some((16384, Some(2), Fork::Init)));
    }

    #[test]
    fn rejects_non_numeric_leading_component() {
        assert_eq!(parse_datafile_name("pg_control"), None);
    }

    #[test]
    fn rejects_more_than_two_numeric_components() {
        assert_eq!(parse_datafile_name("16384.2.5"), None);
    }

    #[test]
    fn excludes_wal_directory_contents() {
        assert!(classify_relative_path(Path::new("pg_wal/000000010000000000000001")).is_none());
    }

    #[test]
    fn excludes_named_control_files() {
        assert!(classify_relative_path(Path::new("postmaster.pid")).is_none());
        assert!(classify_relative_path(Path::new("backup_label")).is_none());
    }

    #[test]
    fn classifies_base_datafile() {
        let classified = classify_relative_path(Path::new("base/16385/16390")).unwrap();
        assert!(classified.is_datafile);
        assert_eq!(classified.db_oid, Some(16385));
        assert_eq!(classified.rel_oid, Some(16390));
    }

    #[test]
    fn classifies_tablespace_datafile_with_tablespace_oid() {
        let classified =
            classify_relative_path(Path::new("pg_tblspc/20000/PG_16_202307071/16385/16390")).unwrap();
        assert!(classified.is_datafile);
        assert_eq!(classified.tablespace_oid, Some(20000));
    }

    #[test]
    fn excludes_ptrack_fork() {
        assert!(classify_relative_path(Path::new("base/16385/16390_ptrack")).is_none());
    }

    #[test]
    fn cfm_fork_is_marked_cfs() {
        let classified = classify_relative_path(Path::new("base/16385/16390_cfm")).unwrap();
        assert!(classified.is_cfs);
    }

    #[test]
    fn excludes_per_database_temp_files() {
        assert!(classify_relative_path(Path::new("base/16385/t3_16390")).is_none());
    }

    #[test]
    fn non_datafile_zone_file_is_kept_but_not_a_datafile() {
        let classified = classify_relative_path(Path::new("global/pg_control")).unwrap();
        assert!(!classified.is_datafile);
    }
}
