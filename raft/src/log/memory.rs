//! An in-memory [`LogStore`], primarily for tests.

use std::convert::Infallible;

use crate::message::{LogEntry, LogIndex, NodeId, Term};

use super::LogStore;

/// A [`LogStore`] backed by a plain `Vec`, with the persisted election
/// state held alongside for inspection.
#[derive(Default)]
pub struct InMemoryLog {
    entries: Vec<LogEntry>,
    saved_term: Term,
    saved_vote: Option<NodeId>,
    sync_count: u64,
}

impl InMemoryLog {
    pub fn new() -> Self {
        InMemoryLog::default()
    }

    /// The `(term, voted_for)` a restart would recover.
    pub fn saved_state(&self) -> (Term, Option<NodeId>) {
        (self.saved_term, self.saved_vote)
    }

    /// How many times [`LogStore::sync`] has been called.
    pub fn sync_count(&self) -> u64 {
        self.sync_count
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }
}

impl LogStore for InMemoryLog {
    type Error = Infallible;

    fn append(&mut self, entry: LogEntry) -> Result<(), Self::Error> {
        debug_assert_eq!(entry.index, self.last_index() + 1);
        self.entries.push(entry);
        Ok(())
    }

    fn truncate_from(&mut self, from: LogIndex) -> Result<usize, Self::Error> {
        let keep = from.saturating_sub(1) as usize;
        let removed = self.entries.len().saturating_sub(keep);
        self.entries.truncate(keep);
        Ok(removed)
    }

    fn entry(&self, index: LogIndex) -> Option<&LogEntry> {
        index
            .checked_sub(1)
            .and_then(|offset| self.entries.get(offset as usize))
    }

    fn last_index(&self) -> LogIndex {
        self.entries.len() as LogIndex
    }

    fn save_vote(&mut self, term: Term, voted_for: NodeId) -> Result<(), Self::Error> {
        self.saved_term = term;
        self.saved_vote = Some(voted_for);
        Ok(())
    }

    fn save_term(&mut self, term: Term) -> Result<(), Self::Error> {
        self.saved_term = term;
        self.saved_vote = None;
        Ok(())
    }

    fn sync(&mut self) -> Result<(), Self::Error> {
        self.sync_count += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use crate::message::CommandType;

    use super::*;

    fn entry(term: Term, index: LogIndex) -> LogEntry {
        LogEntry {
            term,
            index,
            command_type: CommandType::Set,
            data: Bytes::from(vec![index as u8]),
        }
    }

    #[test]
    fn append_get_truncate() {
        let mut log = InMemoryLog::new();
        assert_eq!(log.last_index(), 0);
        assert_eq!(log.term_at(0), Some(0));
        assert_eq!(log.term_at(1), None);

        for index in 1..=5 {
            log.append(entry(2, index)).unwrap();
        }
        assert_eq!(log.last_index(), 5);
        assert_eq!(log.last_term(), 2);
        assert_eq!(log.entry(3).unwrap().index, 3);

        assert_eq!(log.truncate_from(4).unwrap(), 2);
        assert_eq!(log.last_index(), 3);
        assert_eq!(log.entry(4), None);
    }

    #[test]
    fn entries_from_respects_max() {
        let mut log = InMemoryLog::new();
        for index in 1..=10 {
            log.append(entry(1, index)).unwrap();
        }
        let batch = log.entries_from(4, 3);
        assert_eq!(batch.len(), 3);
        assert_eq!(batch[0].index, 4);
        assert_eq!(batch[2].index, 6);
        assert_eq!(log.entries_from(11, 3).len(), 0);
    }

    #[test]
    fn vote_then_term_clears_vote() {
        let mut log = InMemoryLog::new();
        log.save_vote(3, 2).unwrap();
        assert_eq!(log.saved_state(), (3, Some(2)));
        log.save_term(4).unwrap();
        assert_eq!(log.saved_state(), (4, None));
    }
}
