//! History merge engine.
//!
//! Concatenates two histories and normalizes the result: one record per
//! distinct command, earliest non-zero timestamp wins, untimed records
//! first in order of appearance, then ascending by timestamp.

use std::collections::HashMap;

use tracing::debug;

use super::record::HistorySet;

/// Counters describing what a merge did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    /// Commands present on both sides whose timestamps disagreed.
    pub conflicts_resolved: u64,
    /// Commands only the local side had.
    pub only_local: u64,
    /// Commands only the remote side had.
    pub only_remote: u64,
}

/// Merge two histories into a new, normalized set.
pub fn merge(local: &HistorySet, remote: &HistorySet) -> HistorySet {
    HistorySet::from_records(local.iter().chain(remote.iter()).cloned())
}

/// Merge and report counters alongside the result.
pub fn merge_report(local: &HistorySet, remote: &HistorySet) -> (HistorySet, MergeStats) {
    let remote_index: HashMap<&str, i64> = remote
        .iter()
        .map(|r| (r.command(), r.timestamp()))
        .collect();

    let mut stats = MergeStats::default();
    for record in local {
        match remote_index.get(record.command()) {
            Some(&remote_ts) if remote_ts != record.timestamp() => stats.conflicts_resolved += 1,
            Some(_) => {}
            None => stats.only_local += 1,
        }
    }
    stats.only_remote = remote
        .iter()
        .filter(|r| !local.contains_command(r.command()))
        .count() as u64;

    let merged = merge(local, remote);
    debug!(
        local = local.len(),
        remote = remote.len(),
        merged = merged.len(),
        conflicts = stats.conflicts_resolved,
        "merged histories"
    );
    (merged, stats)
}
