//! The replicated log: a 1-origin append-only sequence with a fixed sentinel
//! at index 0, so `prev_log_index` arithmetic is total for any live index.

use crate::message::LogEntry;

#[derive(Debug, Default)]
pub struct Log {
    entries: Vec<LogEntry>,
}

impl Log {
    pub fn new() -> Self {
        Log { entries: vec![LogEntry::sentinel()] }
    }

    /// Highest valid index, including the sentinel.
    pub fn last_index(&self) -> u64 {
        self.entries.len() as u64 - 1
    }

    pub fn last_term(&self) -> u64 {
        self.entries.last().map(|e| e.term).unwrap_or(0)
    }

    pub fn get(&self, index: u64) -> Option<&LogEntry> {
        self.entries.get(index as usize)
    }

    pub fn term_at(&self, index: u64) -> Option<u64> {
        self.get(index).map(|e| e.term)
    }

    /// Entries in `[from, last_index]`, inclusive.
    pub fn slice_from(&self, from: u64) -> &[LogEntry] {
        let from = (from as usize).min(self.entries.len());
        &self.entries[from..]
    }

    /// Leader-only: append a new entry at the tail, returning its index.
    pub fn append(&mut self, entry: LogEntry) -> u64 {
        self.entries.push(entry);
        self.last_index()
    }

    /// Leader-only: append a batch of entries already stamped with a term,
    /// returning the index of the last one.
    pub fn append_all(&mut self, entries: impl IntoIterator<Item = LogEntry>) -> u64 {
        for e in entries {
            self.entries.push(e);
        }
        self.last_index()
    }

    /// Follower-only: discard every entry from `index` onward.
    pub fn truncate_from(&mut self, index: u64) {
        self.entries.truncate(index as usize);
    }

    /// True iff `prev_index` is within bounds and carries `prev_term`.
    pub fn matches(&self, prev_index: u64, prev_term: u64) -> bool {
        self.term_at(prev_index) == Some(prev_term)
    }

    /// Accelerated conflict hint used by the leader to back off `next_index`
    /// in one jump instead of decrementing by one per round trip.
    ///
    /// If `index` is beyond the log, the hint is the last valid index;
    /// otherwise it is the smallest index sharing `log[index]`'s term.
    pub fn first_conflict_index(&self, index: u64) -> u64 {
        if index > self.last_index() {
            return self.last_index();
        }
        let conflict_term = self.entries[index as usize].term;
        let mut i = index;
        while i > 0 && self.entries[(i - 1) as usize].term == conflict_term {
            i -= 1;
        }
        i
    }

    /// Committed slice `[1, commit_index]` inclusive, used for MID dedup scans.
    pub fn committed_slice(&self, commit_index: u64) -> &[LogEntry] {
        let end = (commit_index as usize + 1).min(self.entries.len());
        &self.entries[1.min(end)..end]
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        false // the sentinel always occupies index 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Command;

    fn put(term: u64, mid: &str) -> LogEntry {
        LogEntry {
            term,
            command: Command::Put { src: "c".into(), mid: mid.into(), key: "k".into(), value: "v".into() },
        }
    }

    #[test]
    fn new_log_has_only_the_sentinel() {
        let log = Log::new();
        assert_eq!(log.last_index(), 0);
        assert_eq!(log.last_term(), 0);
    }

    #[test]
    fn append_assigns_increasing_indices() {
        let mut log = Log::new();
        assert_eq!(log.append(put(1, "a")), 1);
        assert_eq!(log.append(put(1, "b")), 2);
        assert_eq!(log.last_index(), 2);
    }

    #[test]
    fn matches_checks_term_at_index() {
        let mut log = Log::new();
        log.append(put(1, "a"));
        assert!(log.matches(0, 0));
        assert!(log.matches(1, 1));
        assert!(!log.matches(1, 2));
        assert!(!log.matches(5, 1));
    }

    #[test]
    fn truncate_from_discards_suffix() {
        let mut log = Log::new();
        log.append(put(1, "a"));
        log.append(put(1, "b"));
        log.append(put(2, "c"));
        log.truncate_from(2);
        assert_eq!(log.last_index(), 1);
    }

    #[test]
    fn first_conflict_index_beyond_log_returns_last_index() {
        let mut log = Log::new();
        log.append(put(1, "a"));
        assert_eq!(log.first_conflict_index(10), 1);
    }

    #[test]
    fn first_conflict_index_finds_start_of_term_run() {
        let mut log = Log::new();
        log.append(put(1, "a"));
        log.append(put(1, "b"));
        log.append(put(2, "c"));
        assert_eq!(log.first_conflict_index(2), 1);
        assert_eq!(log.first_conflict_index(3), 3);
    }

    #[test]
    fn committed_slice_excludes_sentinel_and_uncommitted_tail() {
        let mut log = Log::new();
        log.append(put(1, "a"));
        log.append(put(1, "b"));
        let slice = log.committed_slice(1);
        assert_eq!(slice.len(), 1);
        assert!(matches!(&slice[0].command, Command::Put { mid, .. } if mid == "a"));
    }
}
