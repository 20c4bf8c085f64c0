//! Timeline forest construction and §4.8 `wal-depth` retention, driven
//! through the public `timeline` API.

use std::collections::HashMap;

use pbackup::catalog::backup::{Backup, BackupId, BackupMode, BackupStatus};
use pbackup::lsn::Lsn;
use pbackup::page::CompressAlgorithm;
use pbackup::timeline::{self, SegnoInterval, WalArchiveEntry};

fn backup(id: u64, tli: u32, start: u64, stop: u64, status: BackupStatus, stream: bool) -> Backup {
    Backup {
        id: BackupId(id),
        parent_backup: None,
        merge_dest_id: None,
        mode: BackupMode::Full,
        status,
        timeline_id: tli,
        start_lsn: Lsn(start),
        stop_lsn: Lsn(stop),
        start_time: id,
        end_time: Some(id + 1),
        merge_time: None,
        recovery_xid: None,
        recovery_time: None,
        expire_time: None,
        content_crc: 0,
        program_version: "1.0".into(),
        server_version: "16".into(),
        block_size: 8192,
        xlog_block_size: 8192,
        checksum_version: 1,
        compress_alg: CompressAlgorithm::None,
        compress_level: 0,
        stream,
        from_replica: false,
        data_bytes: 0,
        wal_bytes: 0,
        uncompressed_bytes: 0,
        pgdata_bytes: 0,
        primary_conninfo: None,
        external_dirs: vec![],
        note: None,
    }
}

#[test]
fn a_gap_in_the_segment_sequence_is_recorded_as_lost() {
    let entries = vec![
        WalArchiveEntry { name: "000000010000000000000000", size: 16 * 1024 * 1024 },
        WalArchiveEntry { name: "000000010000000000000001", size: 16 * 1024 * 1024 },
        WalArchiveEntry { name: "000000010000000000000004", size: 16 * 1024 * 1024 },
    ];
    let forest = timeline::build_forest(&entries, &HashMap::new(), &[]);
    let tlinfo = forest.get(forest.find_by_tli(1).unwrap());
    assert_eq!(tlinfo.lost_segments, vec![SegnoInterval { begin_segno: 2, end_segno: 3 }]);
    assert_eq!(tlinfo.n_xlog_files, 3);
}

#[test]
fn retention_anchors_on_the_nth_valid_backup_from_newest() {
    let backups = vec![
        backup(4, 1, 400, 410, BackupStatus::Ok, true),
        backup(3, 1, 300, 310, BackupStatus::Ok, true),
        backup(2, 1, 200, 210, BackupStatus::Ok, true),
        backup(1, 1, 100, 110, BackupStatus::Ok, true),
    ];
    let entries = vec![WalArchiveEntry { name: "000000010000000000000000", size: 1 }];
    let mut forest = timeline::build_forest(&entries, &HashMap::new(), &backups);
    let _ = timeline::compute_retention(&mut forest, &backups, 2, 1000);
    let tlinfo = forest.get(forest.find_by_tli(1).unwrap());
    assert_eq!(tlinfo.anchor_lsn, Lsn(300));
}

#[test]
fn a_pinned_backup_is_skipped_when_counting_toward_the_anchor() {
    let mut pinned = backup(4, 1, 400, 410, BackupStatus::Ok, true);
    pinned.expire_time = Some(5000);
    let backups = vec![pinned, backup(3, 1, 300, 310, BackupStatus::Ok, true), backup(2, 1, 200, 210, BackupStatus::Ok, true)];
    let entries = vec![WalArchiveEntry { name: "000000010000000000000000", size: 1 }];
    let mut forest = timeline::build_forest(&entries, &HashMap::new(), &backups);
    let _ = timeline::compute_retention(&mut forest, &backups, 2, 1000);
    let tlinfo = forest.get(forest.find_by_tli(1).unwrap());
    assert_eq!(tlinfo.anchor_lsn, Lsn(200));
}

#[test]
fn a_child_timeline_with_no_backup_inherits_an_anchor_from_its_parent() {
    let backups = vec![backup(1, 1, 100, 110, BackupStatus::Ok, true)];
    let entries = vec![
        WalArchiveEntry { name: "000000010000000000000000", size: 1 },
        WalArchiveEntry { name: "000000020000000000000000", size: 1 },
        WalArchiveEntry { name: "00000002.history", size: 0 },
    ];
    let mut histories = HashMap::new();
    histories.insert(2u32, "1\t0/C8\n".to_string());
    let mut forest = timeline::build_forest(&entries, &histories, &backups);
    let _ = timeline::compute_retention(&mut forest, &backups, 1, 1000);
    let child = forest.get(forest.find_by_tli(2).unwrap());
    assert_eq!(child.anchor_tli, 1);
}

#[test]
fn wal_depth_zero_keeps_nothing() {
    let backups = vec![backup(1, 1, 100, 110, BackupStatus::Ok, true)];
    let entries = vec![WalArchiveEntry { name: "000000010000000000000000", size: 1 }];
    let mut forest = timeline::build_forest(&entries, &HashMap::new(), &backups);
    let keep = timeline::compute_retention(&mut forest, &backups, 0, 1000);
    assert!(keep.is_empty());
}
