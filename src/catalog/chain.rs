//! Parent-chain resolution: walking `parent_backup` links back to a FULL base.

use std::collections::HashMap;

use super::backup::{Backup, BackupId};
use crate::timeline::TimelineForest;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainState {
    /// Every `parent_backup` link resolves and every ancestor is OK/DONE.
    Ok,
    /// Every link resolves, but at least one ancestor has some other status.
    Invalid,
    /// Some `parent_backup` does not resolve to a known backup.
    Broken,
}

/// Resolve the full ancestor chain of `target`, returning backups ordered
/// newest (the target) to oldest (the FULL base), and the chain's validity.
///
/// `by_id` indexes every backup in the same instance by id.
#[must_use]
pub fn scan_parent_chain<'a>(by_id: &HashMap<BackupId, &'a Backup>, target: &'a Backup) -> (Vec<&'a Backup>, ChainState) {
    let mut chain = vec![target];
    let mut state = ChainState::Ok;
    let mut current = target;

    while let Some(parent_id) = current.parent_backup {
        match by_id.get(&parent_id) {
            None => {
                state = ChainState::Broken;
                break;
            }
            Some(parent) => {
                if !parent.status.is_valid_ancestor() && state == ChainState::Ok {
                    state = ChainState::Invalid;
                }
                chain.push(parent);
                current = parent;
            }
        }
    }

    (chain, state)
}

/// Find the most recent valid (OK/DONE) FULL backup on `timeline_id`, the
/// natural parent candidate for a new incremental in the single-timeline case.
#[must_use]
pub fn latest_full_on_timeline<'a>(backups: &[&'a Backup], timeline_id: u32) -> Option<&'a Backup> {
    backups
        .iter()
        .filter(|b| b.is_full() && b.timeline_id == timeline_id && b.status.is_valid_ancestor())
        .max_by_key(|b| b.start_time)
        .copied()
}

/// Among backups descending from `full`, return the most recent one whose
/// chain back to `full` is entirely intact (`ChainState::Ok`).
#[must_use]
pub fn latest_valid_descendant<'a>(
    by_id: &HashMap<BackupId, &'a Backup>,
    backups: &[&'a Backup],
    full: &'a Backup,
) -> Option<&'a Backup> {
    backups
        .iter()
        .filter(|b| b.status.is_valid_ancestor())
        .filter(|b| {
            let (chain, state) = scan_parent_chain(by_id, b);
            state == ChainState::Ok && chain.last().is_some_and(|base| base.id == full.id)
        })
        .max_by_key(|b| b.start_time)
        .copied()
}

/// Resolve the parent for a new incremental backup when `timeline_id` carries
/// no FULL backup of its own (§4.7 "Multi-timeline case"): walk `parent_tli`
/// links up the timeline forest, and on the first ancestor timeline holding a
/// FULL backup whose `stop_lsn` is at or before the switchpoint the descent
/// passed through, resolve that FULL's latest valid descendant exactly as the
/// single-timeline case does. Mirrors `timeline::closest_backup`'s walk, but
/// for selecting a new backup's parent rather than a WAL retention anchor.
#[must_use]
pub fn last_data_backup_across_timelines<'a>(
    by_id: &HashMap<BackupId, &'a Backup>,
    backups: &[&'a Backup],
    forest: &TimelineForest,
    timeline_id: u32,
) -> Option<&'a Backup> {
    if let Some(full) = latest_full_on_timeline(backups, timeline_id) {
        return Some(latest_valid_descendant(by_id, backups, full).unwrap_or(full));
    }

    let mut idx = forest.find_by_tli(timeline_id)?;
    loop {
        let info = forest.get(idx);
        let switchpoint = info.switchpoint_lsn;
        let parent_idx = info.parent?;
        let parent_tli = forest.get(parent_idx).tli;

        let full = backups
            .iter()
            .filter(|b| {
                b.is_full()
                    && b.timeline_id == parent_tli
                    && b.status.is_valid_ancestor()
                    && b.stop_lsn.is_valid()
                    && b.stop_lsn.0 <= switchpoint.0
            })
            .max_by_key(|b| b.stop_lsn.0)
            .copied();

        if let Some(full) = full {
            return Some(latest_valid_descendant(by_id, backups, full).unwrap_or(full));
        }

        idx = parent_idx;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::backup::{BackupMode, BackupStatus};
    use crate::lsn::Lsn;
    use crate::page::CompressAlgorithm;

    fn backup(id: u64, parent: Option<u64>, status: BackupStatus) -> Backup {
        Backup {
            id: BackupId(id),
            parent_backup: parent.map(BackupId),
            merge_dest_id: None,
            mode: if parent.is_some() { BackupMode::Delta } else { BackupMode::Full },
            status,
            timeline_id: 1,
            start_lsn: Lsn(id),
            stop_lsn: Lsn(id + 1),
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
            stream: true,
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
    fn chain_ok_when_all_ancestors_valid() {
        let full = backup(1, None, BackupStatus::Ok);
        let d1 = backup(2, Some(1), BackupStatus::Ok);
        let d2 = backup(3, Some(2), BackupStatus::Done);
        let by_id: HashMap<_, _> = [(full.id, &full), (d1.id, &d1), (d2.id, &d2)].into_iter().collect();
        let (chain, state) = scan_parent_chain(&by_id, &d2);
        assert_eq!(state, ChainState::Ok);
        assert_eq!(chain.len(), 3);
        assert_eq!(chain.last().unwrap().id, full.id);
    }

    #[test]
    fn chain_invalid_when_ancestor_not_ok_or_done() {
        let full = backup(1, None, BackupStatus::Corrupt);
        let d1 = backup(2, Some(1), BackupStatus::Ok);
        let by_id: HashMap<_, _> = [(full.id, &full), (d1.id, &d1)].into_iter().collect();
        let (_, state) = scan_parent_chain(&by_id, &d1);
        assert_eq!(state, ChainState::Invalid);
    }

    #[test]
    fn chain_broken_when_parent_missing() {
        let d1 = backup(2, Some(999), BackupStatus::Ok);
        let by_id: HashMap<_, _> = [(d1.id, &d1)].into_iter().collect();
        let (_, state) = scan_parent_chain(&by_id, &d1);
        assert_eq!(state, ChainState::Broken);
    }

    #[test]
    fn latest_full_picks_newest_valid_full() {
        let f1 = backup(1, None, BackupStatus::Ok);
        let f2 = backup(5, None, BackupStatus::Ok);
        let f3_running = backup(9, None, BackupStatus::Running);
        let backups = vec![&f1, &f2, &f3_running];
        let latest = latest_full_on_timeline(&backups, 1).unwrap();
        assert_eq!(latest.id, f2.id);
    }

    fn backup_on(id: u64, timeline_id: u32, stop_lsn: u64, status: BackupStatus) -> Backup {
        let mut b = backup(id, None, status);
        b.timeline_id = timeline_id;
        b.stop_lsn = Lsn(stop_lsn);
        b
    }

    #[test]
    fn multi_timeline_falls_back_to_ancestor_timeline_full() {
        use crate::timeline::{self, WalArchiveEntry};

        // Timeline 2 switched off timeline 1 at LSN 100, and has no FULL of
        // its own; the only FULL lives on timeline 1, before the switchpoint.
        let full_on_parent = backup_on(1, 1, 100, BackupStatus::Ok);
        let backups = vec![full_on_parent];
        let by_id = super::index_by_id(&backups);
        let refs: Vec<&Backup> = backups.iter().collect();

        let entries = [
            WalArchiveEntry { name: "00000001000000000000000A", size: 0 },
            WalArchiveEntry { name: "00000002000000000000000B", size: 0 },
            WalArchiveEntry { name: "00000002.history", size: 0 },
        ];
        let mut histories = HashMap::new();
        histories.insert(2u32, "1\t0/64\n".to_string());
        let forest = timeline::build_forest(&entries, &histories, &backups);

        let resolved = last_data_backup_across_timelines(&by_id, &refs, &forest, 2).unwrap();
        assert_eq!(resolved.id, BackupId(1));
    }

    #[test]
    fn multi_timeline_prefers_same_timeline_full_when_present() {
        use crate::timeline::{self, WalArchiveEntry};

        let full_on_parent = backup_on(1, 1, 100, BackupStatus::Ok);
        let full_on_child = backup_on(2, 2, 50, BackupStatus::Ok);
        let backups = vec![full_on_parent, full_on_child];
        let by_id = super::index_by_id(&backups);
        let refs: Vec<&Backup> = backups.iter().collect();

        let entries = [
            WalArchiveEntry { name: "00000002000000000000000B", size: 0 },
            WalArchiveEntry { name: "00000002.history", size: 0 },
        ];
        let mut histories = HashMap::new();
        histories.insert(2u32, "1\t0/64\n".to_string());
        let forest = timeline::build_forest(&entries, &histories, &backups);

        let resolved = last_data_backup_across_timelines(&by_id, &refs, &forest, 2).unwrap();
        assert_eq!(resolved.id, BackupId(2));
    }
}
