use serde::{Deserialize, Serialize};

/// A single slot in the replicated log.
///
/// Index 0 of a [RWLog]'s tail is always a sentinel mirroring the current
/// snapshot metadata (see [RWLog::term_at]); real commands start at index 1.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LogEntry {
    pub index: u64,
    pub term: u64,
    pub kind: LogEntryKind,
    pub payload: Vec<u8>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum LogEntryKind {
    Command,
    Snapshot,
}

/// The in-memory log, truncated at the front by snapshot compaction.
///
/// Absolute indices are used everywhere outside this type; internally they
/// are translated to offsets into `tail` via `snapshot_index`.
pub struct RWLog {
    snapshot_index: u64,
    snapshot_term: u64,
    /// tail[0] is the snapshot sentinel (index == snapshot_index). Real
    /// entries occupy tail[1..].
    tail: Vec<LogEntry>,
}

impl RWLog {
    pub fn new(snapshot_index: u64, snapshot_term: u64, tail_after_snapshot: Vec<LogEntry>) -> Self {
        let mut tail = Vec::with_capacity(tail_after_snapshot.len() + 1);
        tail.push(LogEntry {
            index: snapshot_index,
            term: snapshot_term,
            kind: LogEntryKind::Snapshot,
            payload: vec![],
        });
        tail.extend(tail_after_snapshot);
        Self {
            snapshot_index,
            snapshot_term,
            tail,
        }
    }

    pub fn snapshot_index(&self) -> u64 {
        self.snapshot_index
    }

    pub fn snapshot_term(&self) -> u64 {
        self.snapshot_term
    }

    pub fn last_index(&self) -> u64 {
        self.snapshot_index + (self.tail.len() as u64 - 1)
    }

    pub fn last_term(&self) -> u64 {
        self.tail.last().unwrap().term
    }

    fn offset(&self, index: u64) -> Option<usize> {
        if index < self.snapshot_index {
            return None;
        }
        let off = index - self.snapshot_index;
        if off as usize >= self.tail.len() {
            None
        } else {
            Some(off as usize)
        }
    }

    /// Term of the entry at `index`, or None if it is before the snapshot or
    /// past the end of the log.
    pub fn term_at(&self, index: u64) -> Option<u64> {
        self.offset(index).map(|off| self.tail[off].term)
    }

    pub fn entry_at(&self, index: u64) -> Option<&LogEntry> {
        self.offset(index).and_then(|off| {
            if off == 0 {
                None
            } else {
                Some(&self.tail[off])
            }
        })
    }

    /// Entries strictly after `index`, up to the end of the log.
    pub fn entries_after(&self, index: u64) -> Vec<LogEntry> {
        match self.offset(index) {
            Some(off) => self.tail[(off + 1)..].to_vec(),
            None if index < self.snapshot_index => self.tail[1..].to_vec(),
            None => vec![],
        }
    }

    pub fn persisted_tail(&self) -> Vec<LogEntry> {
        self.tail[1..].to_vec()
    }

    /// Appends a new command entry with the given term, returning its index.
    pub fn append(&mut self, term: u64, payload: Vec<u8>) -> u64 {
        let index = self.last_index() + 1;
        self.tail.push(LogEntry {
            index,
            term,
            kind: LogEntryKind::Command,
            payload,
        });
        index
    }

    /// Merges `entries` (contiguous, starting at absolute index `start_index`)
    /// into the log. Walks the existing tail against `entries` term-by-term
    /// and only truncates/appends from the first mismatching index; a prefix
    /// of `entries` that already matches the tail is left untouched.
    pub fn truncate_and_append(&mut self, start_index: u64, entries: Vec<LogEntry>) {
        let mut matched = 0;
        for entry in entries.iter() {
            let idx = start_index + matched as u64;
            match self.offset(idx) {
                Some(off) if off > 0 && self.tail[off].term == entry.term => matched += 1,
                _ => break,
            }
        }
        if matched == entries.len() {
            return;
        }
        let first_new_index = start_index + matched as u64;
        if let Some(off) = self.offset(first_new_index) {
            self.tail.truncate(off.max(1));
        }
        self.tail.extend(entries.into_iter().skip(matched));
    }

    /// Drops all entries at or before `index` and installs a new sentinel at
    /// (index, term). Ignored if index is not newer than the current
    /// snapshot.
    pub fn compact(&mut self, index: u64, term: u64) {
        if index <= self.snapshot_index {
            return;
        }
        let remaining: Vec<LogEntry> = match self.offset(index) {
            Some(off) => self.tail[(off + 1)..].to_vec(),
            None => vec![],
        };
        self.snapshot_index = index;
        self.snapshot_term = term;
        let mut tail = Vec::with_capacity(remaining.len() + 1);
        tail.push(LogEntry {
            index,
            term,
            kind: LogEntryKind::Snapshot,
            payload: vec![],
        });
        tail.extend(remaining);
        self.tail = tail;
    }

    /// Installs a snapshot that replaces the whole log (used when a follower
    /// is so far behind that none of its entries overlap the new snapshot).
    pub fn install_snapshot(&mut self, index: u64, term: u64) {
        self.snapshot_index = index;
        self.snapshot_term = term;
        self.tail = vec![LogEntry {
            index,
            term,
            kind: LogEntryKind::Snapshot,
            payload: vec![],
        }];
    }

    /// Compares (last_term, last_index) against a candidate's, per the
    /// RequestVote up-to-date rule.
    pub fn is_at_least_as_up_to_date_as(&self, other_last_term: u64, other_last_index: u64) -> bool {
        let (lt, li) = (self.last_term(), self.last_index());
        if lt != other_last_term {
            lt > other_last_term
        } else {
            li > other_last_index
        }
    }

    /// Walks left from `index` to find the first entry with the same term,
    /// used to compute AppendEntries conflict hints.
    pub fn first_index_with_term(&self, term: u64) -> u64 {
        let mut idx = self.snapshot_index.max(1);
        for entry in self.tail.iter() {
            if entry.term == term {
                idx = entry.index;
                break;
            }
        }
        idx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_read_back() {
        let mut log = RWLog::new(0, 0, vec![]);
        let i1 = log.append(1, b"a".to_vec());
        let i2 = log.append(1, b"b".to_vec());
        assert_eq!(i1, 1);
        assert_eq!(i2, 2);
        assert_eq!(log.last_index(), 2);
        assert_eq!(log.term_at(1), Some(1));
        assert_eq!(log.entry_at(2).unwrap().payload, b"b".to_vec());
    }

    #[test]
    fn truncate_on_conflict() {
        let mut log = RWLog::new(0, 0, vec![]);
        log.append(1, b"a".to_vec());
        log.append(1, b"b".to_vec());
        log.truncate_and_append(
            2,
            vec![LogEntry {
                index: 2,
                term: 2,
                kind: LogEntryKind::Command,
                payload: b"c".to_vec(),
            }],
        );
        assert_eq!(log.last_index(), 2);
        assert_eq!(log.term_at(2), Some(2));
    }

    #[test]
    fn truncate_and_append_is_noop_on_matching_prefix() {
        let mut log = RWLog::new(0, 0, vec![]);
        log.append(1, b"a".to_vec());
        log.append(1, b"b".to_vec());
        log.truncate_and_append(
            1,
            vec![
                LogEntry {
                    index: 1,
                    term: 1,
                    kind: LogEntryKind::Command,
                    payload: b"zzz".to_vec(),
                },
                LogEntry {
                    index: 2,
                    term: 1,
                    kind: LogEntryKind::Command,
                    payload: b"zzz".to_vec(),
                },
            ],
        );
        assert_eq!(log.last_index(), 2);
        assert_eq!(log.entry_at(1).unwrap().payload, b"a".to_vec());
        assert_eq!(log.entry_at(2).unwrap().payload, b"b".to_vec());
    }

    #[test]
    fn truncate_and_append_keeps_matching_prefix_and_replaces_divergence() {
        let mut log = RWLog::new(0, 0, vec![]);
        log.append(1, b"a".to_vec());
        log.append(1, b"b".to_vec());
        log.append(1, b"c".to_vec());
        log.truncate_and_append(
            2,
            vec![
                LogEntry {
                    index: 2,
                    term: 1,
                    kind: LogEntryKind::Command,
                    payload: b"b".to_vec(),
                },
                LogEntry {
                    index: 3,
                    term: 2,
                    kind: LogEntryKind::Command,
                    payload: b"d".to_vec(),
                },
            ],
        );
        assert_eq!(log.last_index(), 3);
        assert_eq!(log.entry_at(2).unwrap().payload, b"b".to_vec());
        assert_eq!(log.entry_at(3).unwrap().payload, b"d".to_vec());
        assert_eq!(log.term_at(3), Some(2));
    }

    #[test]
    fn compact_drops_prefix() {
        let mut log = RWLog::new(0, 0, vec![]);
        log.append(1, b"a".to_vec());
        log.append(1, b"b".to_vec());
        log.append(2, b"c".to_vec());
        log.compact(2, 1);
        assert_eq!(log.snapshot_index(), 2);
        assert_eq!(log.entry_at(2), None);
        assert_eq!(log.entry_at(3).unwrap().payload, b"c".to_vec());
        assert_eq!(log.term_at(2), Some(1));
    }

    #[test]
    fn up_to_date_comparison() {
        let mut log = RWLog::new(0, 0, vec![]);
        log.append(1, vec![]);
        log.append(2, vec![]);
        assert!(log.is_at_least_as_up_to_date_as(2, 2));
        assert!(log.is_at_least_as_up_to_date_as(1, 100));
        assert!(!log.is_at_least_as_up_to_date_as(3, 0));
    }
}
