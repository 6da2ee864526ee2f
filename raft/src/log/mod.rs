//! Storage seam for the Raft log and election state.
//!
//! The consensus core keeps the full log in memory through this trait and
//! relies on implementations to make appends, votes and term updates
//! durable. The ordering contract matters more than the shape: the core
//! calls [`save_vote`]/[`save_term`]/[`append`] *and then* [`sync`] before
//! it releases any message whose meaning depends on that state having hit
//! stable storage.
//!
//! [`append`]: LogStore::append
//! [`save_term`]: LogStore::save_term
//! [`save_vote`]: LogStore::save_vote
//! [`sync`]: LogStore::sync

use core::fmt;

use crate::message::{LogEntry, LogIndex, NodeId, Term};

pub mod memory;

/// Durable storage for a node's log entries and election state.
///
/// The log is 1-indexed and contiguous; index 0 is "before the first
/// entry" and has term 0.
pub trait LogStore {
    /// Error type of fallible storage operations. An error is fatal to the
    /// node: it must stop participating rather than act on unpersisted
    /// state.
    type Error: fmt::Debug + fmt::Display;

    /// Appends `entry` at `entry.index`, which must be `last_index() + 1`.
    fn append(&mut self, entry: LogEntry) -> Result<(), Self::Error>;

    /// Removes every entry at `from` and after, returning how many were
    /// removed.
    fn truncate_from(&mut self, from: LogIndex) -> Result<usize, Self::Error>;

    /// The entry at `index`, if present.
    fn entry(&self, index: LogIndex) -> Option<&LogEntry>;

    /// The term of the entry at `index`. `Some(0)` for index 0, `None` past
    /// the end of the log.
    fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == 0 {
            Some(0)
        } else {
            self.entry(index).map(|entry| entry.term)
        }
    }

    /// Index of the last entry, or 0 when empty.
    fn last_index(&self) -> LogIndex;

    /// Term of the last entry, or 0 when empty.
    fn last_term(&self) -> Term {
        self.term_at(self.last_index()).unwrap_or(0)
    }

    /// Up to `max` entries starting at `from`, cloned for replication.
    fn entries_from(&self, from: LogIndex, max: usize) -> Vec<LogEntry> {
        let mut entries = Vec::new();
        let mut index = from;
        while entries.len() < max {
            match self.entry(index) {
                Some(entry) => entries.push(entry.clone()),
                None => break,
            }
            index += 1;
        }
        entries
    }

    /// Durably records a vote cast in `term` for `voted_for`.
    fn save_vote(&mut self, term: Term, voted_for: NodeId) -> Result<(), Self::Error>;

    /// Durably records entry into `term` without a vote.
    fn save_term(&mut self, term: Term) -> Result<(), Self::Error>;

    /// Forces previously written records to stable storage.
    fn sync(&mut self) -> Result<(), Self::Error>;
}
