//! History record and duplicate-free history set.

use std::collections::HashMap;
use std::fmt;

/// One parsed entry of a shell history file.
///
/// Equality ignores `source_line`: two records are equal when they carry the
/// same timestamp, duration and command text, however they were spelled on
/// disk.
#[derive(Debug, Clone, Eq)]
pub struct HistoryRecord {
    timestamp: i64,
    elapsed: u64,
    command: String,
    source_line: String,
}

impl HistoryRecord {
    /// Build a record. Returns `None` for an empty command.
    pub fn new(
        timestamp: i64,
        elapsed: u64,
        command: impl Into<String>,
        source_line: impl Into<String>,
    ) -> Option<Self> {
        let command = command.into();
        if command.is_empty() {
            return None;
        }
        let timestamp = timestamp.max(0);
        // Untimed records are written without a marker, so they cannot
        // carry an elapsed time either.
        let elapsed = if timestamp == 0 { 0 } else { elapsed };
        Some(Self {
            timestamp,
            elapsed,
            command,
            source_line: source_line.into(),
        })
    }

    /// Record with a timestamp marker, rendered in zsh extended format.
    pub fn timestamped(timestamp: i64, command: impl Into<String>) -> Option<Self> {
        let command = command.into();
        let line = format!(": {}:0;{}", timestamp, command);
        Self::new(timestamp, 0, command, line)
    }

    /// Legacy record without a timestamp.
    pub fn bare(command: impl Into<String>) -> Option<Self> {
        let command = command.into();
        Self::new(0, 0, command.clone(), command)
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn elapsed(&self) -> u64 {
        self.elapsed
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn source_line(&self) -> &str {
        &self.source_line
    }

    pub fn has_timestamp(&self) -> bool {
        self.timestamp > 0
    }
}

impl PartialEq for HistoryRecord {
    fn eq(&self, other: &Self) -> bool {
        self.timestamp == other.timestamp
            && self.elapsed == other.elapsed
            && self.command == other.command
    }
}

impl fmt::Display for HistoryRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.has_timestamp() {
            write!(f, ": {}:{};{}", self.timestamp, self.elapsed, self.command)
        } else {
            f.write_str(&self.command)
        }
    }
}

/// An ordered, duplicate-free sequence of history records.
///
/// Every constructor normalizes its input: one record per distinct command,
/// carrying the earliest non-zero timestamp seen for it; untimed records
/// first in order of first appearance, then timed records ascending by
/// `(timestamp, command)`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistorySet {
    records: Vec<HistoryRecord>,
}

impl HistorySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Normalize an arbitrary sequence of records into a set.
    pub fn from_records<I>(records: I) -> Self
    where
        I: IntoIterator<Item = HistoryRecord>,
    {
        let mut slots: Vec<HistoryRecord> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();

        for record in records {
            match index.get(record.command()) {
                Some(&slot) => {
                    if prefer(&record, &slots[slot]) {
                        slots[slot] = record;
                    }
                }
                None => {
                    index.insert(record.command.clone(), slots.len());
                    slots.push(record);
                }
            }
        }

        // Stable: untimed records keep first-appearance order.
        slots.sort_by(|a, b| match (a.has_timestamp(), b.has_timestamp()) {
            (false, false) => std::cmp::Ordering::Equal,
            (false, true) => std::cmp::Ordering::Less,
            (true, false) => std::cmp::Ordering::Greater,
            (true, true) => a
                .timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.command.cmp(&b.command)),
        });

        Self { records: slots }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, HistoryRecord> {
        self.records.iter()
    }

    pub fn records(&self) -> &[HistoryRecord] {
        &self.records
    }

    /// Look up the record for an exact command.
    pub fn get(&self, command: &str) -> Option<&HistoryRecord> {
        self.records.iter().find(|r| r.command == command)
    }

    pub fn contains_command(&self, command: &str) -> bool {
        self.get(command).is_some()
    }
}

impl<'a> IntoIterator for &'a HistorySet {
    type Item = &'a HistoryRecord;
    type IntoIter = std::slice::Iter<'a, HistoryRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

impl IntoIterator for HistorySet {
    type Item = HistoryRecord;
    type IntoIter = std::vec::IntoIter<HistoryRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.into_iter()
    }
}

impl FromIterator<HistoryRecord> for HistorySet {
    fn from_iter<I: IntoIterator<Item = HistoryRecord>>(iter: I) -> Self {
        Self::from_records(iter)
    }
}

/// Whether `candidate` should replace `current` for the same command.
///
/// The earliest non-zero timestamp wins, ties broken by the shorter
/// duration; a timed record always beats an untimed one.
fn prefer(candidate: &HistoryRecord, current: &HistoryRecord) -> bool {
    match (candidate.has_timestamp(), current.has_timestamp()) {
        (true, false) => true,
        (false, _) => false,
        (true, true) => {
            (candidate.timestamp, candidate.elapsed) < (current.timestamp, current.elapsed)
        }
    }
}
