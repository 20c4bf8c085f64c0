//! Timeline tree & WAL retention (C8): builds the forest of timelines
//! observed in a WAL archive directory and computes, per §4.8, which WAL
//! segments must survive purge to satisfy a `wal-depth` retention setting.
//!
//! Timelines form a forest (each has at most one parent), so the forest is an
//! indexed arena (`Vec<TimelineInfo>`) with parents referenced by index rather
//! than by owning back-pointer (§9 design note).

use std::collections::HashMap;

use crate::catalog::backup::{Backup, BackupId, BackupStatus};
use crate::lsn::Lsn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalFileKind {
    Segment,
    Partial,
    Temp,
    BackupHistory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParsedWalFile {
    Wal { tli: u32, segno: u64, kind: WalFileKind },
    History { tli: u32 },
}

/// Classify one WAL-archive directory entry by filename: `<tli><segno>[.suffix]`
/// (24 hex digits, tli then segno) or `<tli>.history`.
#[must_use]
pub fn parse_wal_filename(name: &str) -> Option<ParsedWalFile> {
    if name.len() > 8 && name.as_bytes()[..8].iter().all(u8::is_ascii_hexdigit) && &name[8..] == ".history" {
        let tli = u32::from_str_radix(&name[..8], 16).ok()?;
        return Some(ParsedWalFile::History { tli });
    }
    if name.len() < 24 || !name.as_bytes()[..24].iter().all(u8::is_ascii_hexdigit) {
        return None;
    }
    let tli = u32::from_str_radix(&name[..8], 16).ok()?;
    let segno = u64::from_str_radix(&name[8..24], 16).ok()?;
    let rest = &name[24..];
    let kind = match rest {
        "" | ".gz" => WalFileKind::Segment,
        ".partial" | ".partial.gz" => WalFileKind::Partial,
        ".part" | ".gz.part" => WalFileKind::Temp,
        _ if rest.ends_with(".backup") => WalFileKind::BackupHistory,
        _ => return None,
    };
    Some(ParsedWalFile::Wal { tli, segno, kind })
}

/// Parse a `<tli>.history` file's contents and return the immediate parent
/// `(parent_tli, switchpoint_lsn)`: the last line, which records the most
/// recent timeline switch leading up to this one.
#[must_use]
pub fn parse_history_file(contents: &str) -> Option<(u32, Lsn)> {
    contents
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let tli: u32 = fields.next()?.parse().ok()?;
            let lsn: Lsn = fields.next()?.parse().ok()?;
            Some((tli, lsn))
        })
        .next_back()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegnoInterval {
    pub begin_segno: u64,
    pub end_segno: u64,
}

#[derive(Debug, Clone, Default)]
pub struct TimelineInfo {
    pub tli: u32,
    pub parent_tli: u32,
    /// Index into the owning [`TimelineForest`]'s arena, or `None` at the root.
    pub parent: Option<usize>,
    pub switchpoint_lsn: Lsn,
    pub begin_segno: u64,
    pub end_segno: u64,
    pub n_xlog_files: u32,
    pub size: u64,
    pub backups: Vec<BackupId>,
    pub lost_segments: Vec<SegnoInterval>,
    pub keep_segments: Vec<SegnoInterval>,
    pub anchor_lsn: Lsn,
    pub anchor_tli: u32,
    pub oldest_backup: Option<BackupId>,
    pub closest_backup: Option<BackupId>,
}

impl TimelineInfo {
    fn new(tli: u32) -> Self {
        Self { tli, ..Self::default() }
    }
}

#[derive(Debug, Default)]
pub struct TimelineForest {
    timelines: Vec<TimelineInfo>,
}

impl TimelineForest {
    #[must_use]
    pub fn get(&self, idx: usize) -> &TimelineInfo {
        &self.timelines[idx]
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.timelines.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.timelines.is_empty()
    }

    #[must_use]
    pub fn find_by_tli(&self, tli: u32) -> Option<usize> {
        self.timelines.iter().position(|t| t.tli == tli)
    }

    #[must_use]
    pub fn iter(&self) -> std::slice::Iter<'_, TimelineInfo> {
        self.timelines.iter()
    }
}

/// One entry in a WAL archive directory, reduced to what timeline-building
/// needs: its name (for classification) and size.
pub struct WalArchiveEntry<'a> {
    pub name: &'a str,
    pub size: u64,
}

/// Build the timeline forest from a flat listing of a WAL archive directory
/// plus the backups known for this instance. `histories` supplies each
/// timeline's already-parsed `.history` file content (tli → file contents),
/// since reading them is the caller's I/O concern.
#[must_use]
pub fn build_forest(entries: &[WalArchiveEntry<'_>], histories: &HashMap<u32, String>, backups: &[Backup]) -> TimelineForest {
    let mut forest = TimelineForest::default();
    let mut index_of: HashMap<u32, usize> = HashMap::new();

    let mut ensure_tli = |forest: &mut TimelineForest, index_of: &mut HashMap<u32, usize>, tli: u32| -> usize {
        *index_of.entry(tli).or_insert_with(|| {
            forest.timelines.push(TimelineInfo::new(tli));
            forest.timelines.len() - 1
        })
    };

    for entry in entries {
        match parse_wal_filename(entry.name) {
            Some(ParsedWalFile::Wal { tli, segno, kind }) => {
                let idx = ensure_tli(&mut forest, &mut index_of, tli);
                let tlinfo = &mut forest.timelines[idx];
                match kind {
                    WalFileKind::Segment => {
                        if tlinfo.n_xlog_files != 0 {
                            let expected = tlinfo.end_segno + 1;
                            if segno != expected && segno != tlinfo.end_segno {
                                tlinfo.lost_segments.push(SegnoInterval { begin_segno: expected, end_segno: segno - 1 });
                            }
                        }
                        if tlinfo.begin_segno == 0 {
                            tlinfo.begin_segno = segno;
                        }
                        tlinfo.end_segno = segno;
                        tlinfo.n_xlog_files += 1;
                        tlinfo.size += entry.size;
                    }
                    // Any skip before these segments can't be distinguished from "doesn't
                    // exist yet", so partial/temp/backup-history files never feed gap
                    // detection or begin/end_segno, only the eventual purge listing.
                    WalFileKind::Partial | WalFileKind::Temp | WalFileKind::BackupHistory => {}
                }
            }
            Some(ParsedWalFile::History { tli }) => {
                let idx = ensure_tli(&mut forest, &mut index_of, tli);
                if let Some(contents) = histories.get(&tli) {
                    if let Some((parent_tli, switchpoint)) = parse_history_file(contents) {
                        forest.timelines[idx].parent_tli = parent_tli;
                        forest.timelines[idx].switchpoint_lsn = switchpoint;
                        forest.timelines[idx].parent = index_of.get(&parent_tli).copied();
                    }
                }
            }
            None => {}
        }
    }

    // A history file can reference a parent discovered later in the listing;
    // fix up links now that every timeline has an arena slot.
    for i in 0..forest.timelines.len() {
        if forest.timelines[i].parent.is_none() && forest.timelines[i].parent_tli != 0 {
            forest.timelines[i].parent = index_of.get(&forest.timelines[i].parent_tli).copied();
        }
    }

    for backup in backups {
        if let Some(idx) = index_of.get(&backup.timeline_id) {
            forest.timelines[*idx].backups.push(backup.id);
        }
    }

    let by_id: HashMap<BackupId, &Backup> = backups.iter().map(|b| (b.id, b)).collect();
    for i in 0..forest.timelines.len() {
        forest.timelines[i].oldest_backup = oldest_backup(&forest.timelines[i], &by_id);
        forest.timelines[i].closest_backup = closest_backup(&forest, i, &by_id);
    }

    forest
}

fn oldest_backup(tlinfo: &TimelineInfo, by_id: &HashMap<BackupId, &Backup>) -> Option<BackupId> {
    tlinfo
        .backups
        .iter()
        .filter_map(|id| by_id.get(id).copied())
        .filter(|b| b.start_lsn.is_valid())
        .min_by_key(|b| b.start_lsn.0)
        .map(|b| b.id)
}

/// Walk up the parent chain looking for the valid backup, on any ancestor
/// timeline, whose `stop_lsn` is closest to (but at or before) the
/// switchpoint it descends through.
fn closest_backup(forest: &TimelineForest, start: usize, by_id: &HashMap<BackupId, &Backup>) -> Option<BackupId> {
    let mut cursor = forest.timelines[start].parent;
    while let Some(idx) = cursor {
        let tlinfo = &forest.timelines[idx];
        let switchpoint = forest.timelines[start].switchpoint_lsn;
        let candidate = tlinfo
            .backups
            .iter()
            .filter_map(|id| by_id.get(id).copied())
            .filter(|b| b.stop_lsn.is_valid() && b.stop_lsn.0 <= switchpoint.0 && b.status.is_valid_ancestor())
            .max_by_key(|b| b.stop_lsn.0);
        if let Some(b) = candidate {
            return Some(b.id);
        }
        cursor = tlinfo.parent;
    }
    None
}

/// Apply `wal-depth` retention (§4.8): set each timeline's anchor and
/// `keep_segments`, then return the set of `(tli, segno)` pairs that must
/// survive a purge.
#[must_use]
pub fn compute_retention(forest: &mut TimelineForest, backups: &[Backup], wal_depth: u32, now_secs: u64) -> Vec<(u32, u64)> {
    if wal_depth == 0 {
        return Vec::new();
    }
    let by_id: HashMap<BackupId, &Backup> = backups.iter().map(|b| (b.id, b)).collect();

    for i in 0..forest.timelines.len() {
        let mut count = 0u32;
        let mut anchor = None;
        // Backups are listed newest-first in the catalog; assume `backups`
        // (and thus `tlinfo.backups`) preserves that order.
        for id in forest.timelines[i].backups.clone() {
            let Some(backup) = by_id.get(&id) else { continue };
            if !backup.start_lsn.is_valid() || backup.timeline_id == 0 {
                continue;
            }
            if !backup.status.is_valid_ancestor() {
                continue;
            }
            if backup.is_pinned(now_secs) {
                continue;
            }
            count += 1;
            if count == wal_depth {
                anchor = Some((backup.start_lsn, backup.timeline_id));
                break;
            }
        }

        if let Some((lsn, tli)) = anchor {
            forest.timelines[i].anchor_lsn = lsn;
            forest.timelines[i].anchor_tli = tli;
        } else if let Some(closest_id) = forest.timelines[i].closest_backup {
            if let Some(closest) = by_id.get(&closest_id) {
                if closest.start_lsn.is_valid() && closest.timeline_id > 0 {
                    forest.timelines[i].anchor_lsn = closest.start_lsn;
                    forest.timelines[i].anchor_tli = closest.timeline_id;

                    let closest_tli = closest.timeline_id;
                    let mut cursor = forest.timelines[i].parent;
                    let mut switchpoint = forest.timelines[i].switchpoint_lsn;
                    while let Some(idx) = cursor {
                        let begin_segno = if forest.timelines[idx].tli != closest_tli {
                            forest.timelines[idx].begin_segno
                        } else {
                            closest.start_lsn.0 / WAL_SEGMENT_UNIT
                        };
                        let end_segno = switchpoint.0 / WAL_SEGMENT_UNIT;
                        forest.timelines[idx].keep_segments.push(SegnoInterval { begin_segno, end_segno });
                        switchpoint = forest.timelines[idx].switchpoint_lsn;
                        cursor = forest.timelines[idx].parent;
                    }
                }
            }
            continue;
        } else {
            continue;
        }

        let anchor_lsn = forest.timelines[i].anchor_lsn;
        for id in forest.timelines[i].backups.clone().into_iter().skip(count as usize) {
            let Some(backup) = by_id.get(&id) else { continue };
            if backup.stream || !backup.start_lsn.is_valid() || backup.timeline_id == 0 {
                continue;
            }
            if backup.start_lsn.0 >= anchor_lsn.0 {
                continue;
            }
            let begin_segno = backup.start_lsn.0 / WAL_SEGMENT_UNIT;
            let mut end_segno = backup.stop_lsn.0 / WAL_SEGMENT_UNIT;
            if backup.from_replica {
                end_segno += 1;
            }
            forest.timelines[i].keep_segments.push(SegnoInterval { begin_segno, end_segno });
        }
    }

    let mut keep = Vec::new();
    for tlinfo in forest.iter() {
        if !tlinfo.anchor_lsn.is_valid() {
            continue;
        }
        if tlinfo.anchor_tli > 0 && tlinfo.anchor_tli != tlinfo.tli {
            // Anchor lives on another timeline: this whole timeline is protected.
            for segno in tlinfo.begin_segno..=tlinfo.end_segno.max(tlinfo.begin_segno) {
                keep.push((tlinfo.tli, segno));
            }
            continue;
        }
        let anchor_segno = tlinfo.anchor_lsn.0 / WAL_SEGMENT_UNIT;
        for segno in tlinfo.begin_segno..=tlinfo.end_segno.max(tlinfo.begin_segno) {
            if segno >= anchor_segno || tlinfo.keep_segments.iter().any(|iv| segno >= iv.begin_segno && segno <= iv.end_segno) {
                keep.push((tlinfo.tli, segno));
            }
        }
    }
    keep
}

/// A stand-in "segment size" so LSN → segno conversion stays internally
/// consistent without threading the live database's actual WAL segment size
/// through this module (out of scope per §1: WAL segment format parsing).
const WAL_SEGMENT_UNIT: u64 = 16 * 1024 * 1024;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::CompressAlgorithm;

    fn backup(id: u64, tli: u32, start: u64, stop: u64, status: BackupStatus, stream: bool) -> Backup {
        Backup {
            id: BackupId(id),
            parent_backup: None,
            merge_dest_id: None,
            mode: crate::catalog::backup::BackupMode::Full,
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
    fn parses_plain_segment() {
        let parsed = parse_wal_filename("0000000100000000000000AB").unwrap();
        assert_eq!(parsed, ParsedWalFile::Wal { tli: 1, segno: 0xAB, kind: WalFileKind::Segment });
    }

    #[test]
    fn parses_compressed_and_partial_suffixes() {
        assert_eq!(
            parse_wal_filename("0000000100000000000000AB.gz").unwrap(),
            ParsedWalFile::Wal { tli: 1, segno: 0xAB, kind: WalFileKind::Segment }
        );
        assert_eq!(
            parse_wal_filename("0000000100000000000000AB.partial").unwrap(),
            ParsedWalFile::Wal { tli: 1, segno: 0xAB, kind: WalFileKind::Partial }
        );
    }

    #[test]
    fn parses_history_filename() {
        assert_eq!(parse_wal_filename("00000002.history").unwrap(), ParsedWalFile::History { tli: 2 });
    }

    #[test]
    fn gap_in_segment_sequence_is_recorded_as_lost() {
        let entries = vec![
            WalArchiveEntry { name: "000000010000000000000000", size: 16 * 1024 * 1024 },
            WalArchiveEntry { name: "000000010000000000000001", size: 16 * 1024 * 1024 },
            WalArchiveEntry { name: "000000010000000000000004", size: 16 * 1024 * 1024 },
        ];
        let forest = build_forest(&entries, &HashMap::new(), &[]);
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
        let mut forest = build_forest(&entries, &HashMap::new(), &backups);
        // `build_forest` orders `backups` as given (newest-first here), matching
        // the catalog's own newest-first listing.
        let _ = compute_retention(&mut forest, &backups, 2, 1000);
        let tlinfo = forest.get(forest.find_by_tli(1).unwrap());
        assert_eq!(tlinfo.anchor_lsn, Lsn(300));
    }

    #[test]
    fn pinned_backup_is_skipped_when_counting_for_the_anchor() {
        let mut pinned = backup(4, 1, 400, 410, BackupStatus::Ok, true);
        pinned.expire_time = Some(5000);
        let backups = vec![pinned, backup(3, 1, 300, 310, BackupStatus::Ok, true), backup(2, 1, 200, 210, BackupStatus::Ok, true)];
        let entries = vec![WalArchiveEntry { name: "000000010000000000000000", size: 1 }];
        let mut forest = build_forest(&entries, &HashMap::new(), &backups);
        let _ = compute_retention(&mut forest, &backups, 2, 1000);
        let tlinfo = forest.get(forest.find_by_tli(1).unwrap());
        assert_eq!(tlinfo.anchor_lsn, Lsn(200));
    }
}
