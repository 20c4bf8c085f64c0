//! The textual `backup.control` key=value format.

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};

use crate::errors::{BackupError, Result};
use crate::fsutil;
use crate::lsn::Lsn;
use crate::page::CompressAlgorithm;

use super::backup::{Backup, BackupId, BackupMode, BackupStatus};

fn fmt_time(secs: u64) -> String {
    DateTime::<Utc>::from_timestamp(i64::try_from(secs).unwrap_or(i64::MAX), 0)
        .map_or_else(|| secs.to_string(), |dt| dt.to_rfc3339())
}

fn parse_time(s: &str) -> Option<u64> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return u64::try_from(dt.timestamp()).ok();
    }
    s.parse().ok()
}

/// Render a backup's control-file contents. Key order is whatever `HashMap`
/// iteration gives; readers never rely on order.
#[must_use]
pub fn render(backup: &Backup) -> String {
    let mut lines = Vec::new();
    let mut put = |k: &str, v: String| lines.push(format!("{k} = {v}"));

    put("backup-mode", backup.mode.as_str().to_string());
    put("stream", backup.stream.to_string());
    put("compress-alg", backup.compress_alg.as_str().to_string());
    put("compress-level", backup.compress_level.to_string());
    put("from-replica", backup.from_replica.to_string());
    put("block-size", backup.block_size.to_string());
    put("xlog-block-size", backup.xlog_block_size.to_string());
    put("checksum-version", backup.checksum_version.to_string());
    put("program-version", backup.program_version.clone());
    put("server-version", backup.server_version.clone());
    put("timelineid", backup.timeline_id.to_string());
    put("start-lsn", backup.start_lsn.to_string());
    put("stop-lsn", backup.stop_lsn.to_string());
    put("start-time", fmt_time(backup.start_time));
    if let Some(t) = backup.merge_time {
        put("merge-time", fmt_time(t));
    }
    if let Some(t) = backup.end_time {
        put("end-time", fmt_time(t));
    }
    if let Some(xid) = backup.recovery_xid {
        put("recovery-xid", xid.to_string());
    }
    if let Some(t) = backup.recovery_time {
        put("recovery-time", fmt_time(t));
    }
    if let Some(t) = backup.expire_time {
        put("expire-time", fmt_time(t));
    }
    if let Some(id) = backup.merge_dest_id {
        put("merge-dest-id", id.to_string());
    }
    put("data-bytes", backup.data_bytes.to_string());
    put("wal-bytes", backup.wal_bytes.to_string());
    put("uncompressed-bytes", backup.uncompressed_bytes.to_string());
    put("pgdata-bytes", backup.pgdata_bytes.to_string());
    put("status", backup.status.as_str().to_string());
    if let Some(parent) = backup.parent_backup {
        put("parent-backup-id", parent.to_string());
    }
    if let Some(conninfo) = &backup.primary_conninfo {
        put("primary_conninfo", format!("'{conninfo}'"));
    }
    if !backup.external_dirs.is_empty() {
        put("external-dirs", backup.external_dirs.join(":"));
    }
    if let Some(note) = &backup.note {
        put("note", format!("'{note}'"));
    }
    put("content-crc", format!("{:#x}", backup.content_crc));

    lines.join("\n") + "\n"
}

fn unquote(s: &str) -> &str {
    s.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')).unwrap_or(s)
}

/// Parse control-file text into a map of key to raw (unquoted-aware) value.
fn parse_kv(text: &str) -> HashMap<String, String> {
    text.lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                return None;
            }
            let (k, v) = line.split_once('=')?;
            Some((k.trim().to_string(), v.trim().to_string()))
        })
        .collect()
}

/// Parse a control file's contents into a [`Backup`].
///
/// Returns `Ok(None)` (not an error) when the file is empty or lacks
/// `start-time`, matching the "caller should try again later" contract for a
/// control file that is still being written by its owner.
///
/// # Errors
/// Returns an error if a present key's value cannot be parsed.
pub fn parse(text: &str) -> Result<Option<Backup>> {
    if text.trim().is_empty() {
        return Ok(None);
    }
    let map = parse_kv(text);
    let Some(start_time) = map.get("start-time").and_then(|s| parse_time(s)) else {
        return Ok(None);
    };

    let get = |k: &str| map.get(k).map(String::as_str);
    let req = |k: &str| get(k).ok_or_else(|| BackupError::Catalog(format!("control file missing required key `{k}`")));

    let mode = BackupMode::parse(req("backup-mode")?)
        .ok_or_else(|| BackupError::Catalog("invalid backup-mode".into()))?;
    let status = BackupStatus::parse(req("status")?)
        .ok_or_else(|| BackupError::Catalog("invalid status".into()))?;
    let compress_alg = get("compress-alg").and_then(CompressAlgorithm::parse).unwrap_or_default();

    let parse_u64 = |k: &str| -> Result<u64> {
        get(k).unwrap_or("0").parse().map_err(|_| BackupError::Catalog(format!("invalid integer for `{k}`")))
    };
    let parse_i64 = |k: &str| -> Result<i64> {
        get(k).unwrap_or("0").parse().map_err(|_| BackupError::Catalog(format!("invalid integer for `{k}`")))
    };
    let parse_lsn = |k: &str| -> Result<Lsn> {
        get(k).unwrap_or("0/0").parse().map_err(|_| BackupError::Catalog(format!("invalid LSN for `{k}`")))
    };

    Ok(Some(Backup {
        id: BackupId::from_start_time(start_time),
        parent_backup: get("parent-backup-id").and_then(|s| s.parse().ok()),
        merge_dest_id: get("merge-dest-id").and_then(|s| s.parse().ok()),
        mode,
        status,
        timeline_id: get("timelineid").unwrap_or("1").parse().unwrap_or(1),
        start_lsn: parse_lsn("start-lsn")?,
        stop_lsn: parse_lsn("stop-lsn")?,
        start_time,
        end_time: get("end-time").and_then(parse_time),
        merge_time: get("merge-time").and_then(parse_time),
        recovery_xid: get("recovery-xid").and_then(|s| s.parse().ok()),
        recovery_time: get("recovery-time").and_then(parse_time),
        expire_time: get("expire-time").and_then(parse_time),
        content_crc: get("content-crc")
            .and_then(|s| u32::from_str_radix(s.trim_start_matches("0x"), 16).ok())
            .unwrap_or(0),
        program_version: get("program-version").unwrap_or_default().to_string(),
        server_version: get("server-version").unwrap_or_default().to_string(),
        block_size: get("block-size").unwrap_or("8192").parse().unwrap_or(8192),
        xlog_block_size: get("xlog-block-size").unwrap_or("8192").parse().unwrap_or(8192),
        checksum_version: get("checksum-version").unwrap_or("0").parse().unwrap_or(0),
        compress_alg,
        compress_level: get("compress-level").unwrap_or("0").parse().unwrap_or(0),
        stream: get("stream").unwrap_or("false").parse().unwrap_or(false),
        from_replica: get("from-replica").unwrap_or("false").parse().unwrap_or(false),
        data_bytes: parse_i64("data-bytes")?,
        wal_bytes: parse_i64("wal-bytes")?,
        uncompressed_bytes: parse_i64("uncompressed-bytes")?,
        pgdata_bytes: parse_i64("pgdata-bytes")?,
        primary_conninfo: get("primary_conninfo").map(|s| unquote(s).to_string()),
        external_dirs: get("external-dirs")
            .map(|s| s.split(':').map(str::to_string).collect())
            .unwrap_or_default(),
        note: get("note").map(|s| unquote(s).to_string()),
    }))
}

/// Write a backup's control file atomically.
/// # Errors
/// Returns an error if the file cannot be written.
pub fn write(path: &Path, backup: &Backup) -> Result<()> {
    fsutil::atomic_write(path, render(backup).as_bytes())?;
    Ok(())
}

/// Read and parse a control file from disk.
/// # Errors
/// Returns an error on I/O failure or malformed required fields.
pub fn read(path: &Path) -> Result<Option<Backup>> {
    let text = std::fs::read_to_string(path)?;
    parse(&text)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_backup() -> Backup {
        Backup {
            id: BackupId::from_start_time(1_700_000_000),
            parent_backup: None,
            merge_dest_id: None,
            mode: BackupMode::Full,
            status: BackupStatus::Ok,
            timeline_id: 1,
            start_lsn: Lsn(0x100),
            stop_lsn: Lsn(0x300),
            start_time: 1_700_000_000,
            end_time: Some(1_700_000_100),
            merge_time: None,
            recovery_xid: None,
            recovery_time: None,
            expire_time: None,
            content_crc: 0xDEAD_BEEF,
            program_version: "1.0.0".into(),
            server_version: "16".into(),
            block_size: 8192,
            xlog_block_size: 8192,
            checksum_version: 1,
            compress_alg: CompressAlgorithm::Zstd,
            compress_level: 3,
            stream: true,
            from_replica: false,
            data_bytes: 24576,
            wal_bytes: 0,
            uncompressed_bytes: 24576,
            pgdata_bytes: 24576,
            primary_conninfo: None,
            external_dirs: vec![],
            note: Some("release cut".into()),
        }
    }

    #[test]
    fn render_then_parse_round_trips() {
        let backup = sample_backup();
        let text = render(&backup);
        let parsed = parse(&text).unwrap().unwrap();
        assert_eq!(parsed.id, backup.id);
        assert_eq!(parsed.mode, backup.mode);
        assert_eq!(parsed.status, backup.status);
        assert_eq!(parsed.start_lsn, backup.start_lsn);
        assert_eq!(parsed.stop_lsn, backup.stop_lsn);
        assert_eq!(parsed.content_crc, backup.content_crc);
        assert_eq!(parsed.note.as_deref(), Some("release cut"));
    }

    #[test]
    fn empty_file_parses_as_none() {
        assert!(parse("").unwrap().is_none());
        assert!(parse("   \n  \n").unwrap().is_none());
    }

    #[test]
    fn missing_start_time_parses_as_none() {
        assert!(parse("backup-mode = full\nstatus = OK\n").unwrap().is_none());
    }

    #[test]
    fn write_then_read_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backup.control");
        let backup = sample_backup();
        write(&path, &backup).unwrap();
        let read_back = read(&path).unwrap().unwrap();
        assert_eq!(read_back.id, backup.id);
    }
}
