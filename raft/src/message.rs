//! Raft message types exchanged between nodes.
//!
//! These are the in-memory forms of the peer RPCs; the wire encoding lives
//! with the RPC layer of the embedding server. Entry `data` is held as
//! [`Bytes`] so an entry can move between the log, the outbound replication
//! path and the state machine without copying.

use core::fmt;

use bytes::Bytes;

/// Unique identifier of a cluster member.
pub type NodeId = u64;

/// Leadership term; a monotonically increasing logical clock.
pub type Term = u64;

/// 1-based index into the replicated log. `0` means "no entry".
pub type LogIndex = u64;

/// The kind of command carried by a [`LogEntry`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CommandType {
    /// No state change; appended by a new leader to commit prior-term entries.
    Noop,
    /// Create or replace a key.
    Set,
    /// Remove a key.
    Delete,
    /// Compare-and-swap on a key's version.
    Cas,
    /// Reserved for membership changes; applies as a no-op.
    ConfigChange,
}

impl CommandType {
    pub fn as_u8(self) -> u8 {
        match self {
            CommandType::Noop => 0,
            CommandType::Set => 1,
            CommandType::Delete => 2,
            CommandType::Cas => 3,
            CommandType::ConfigChange => 4,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(CommandType::Noop),
            1 => Some(CommandType::Set),
            2 => Some(CommandType::Delete),
            3 => Some(CommandType::Cas),
            4 => Some(CommandType::ConfigChange),
            _ => None,
        }
    }
}

/// An entry in the replicated log.
#[derive(Clone, Debug, PartialEq)]
pub struct LogEntry {
    /// Term of the leader that appended this entry.
    pub term: Term,
    /// Position of the entry in the log.
    pub index: LogIndex,
    /// Kind of command carried in `data`.
    pub command_type: CommandType,
    /// Encoded command; owned by the log.
    pub data: Bytes,
}

/// A request to obtain leadership.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RequestVote {
    pub term: Term,
    pub candidate_id: NodeId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

/// The response to a [`RequestVote`], granting or denying the vote.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RequestVoteResponse {
    pub term: Term,
    pub vote_granted: bool,
}

/// A request to append entries to a peer's log; empty `entries` is a
/// heartbeat.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AppendEntries {
    pub term: Term,
    pub leader_id: NodeId,
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
    pub entries: Vec<LogEntry>,
    pub leader_commit: LogIndex,
}

/// The response to an [`AppendEntries`].
///
/// On rejection, `conflict_term` and `conflict_index` let the leader back
/// up `next_index` by more than one entry per round trip: `conflict_term`
/// is the follower's term at `prev_log_index` (0 if its log is too short)
/// and `conflict_index` is the first index of that term (or the follower's
/// `last_log_index + 1` when too short).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AppendEntriesResponse {
    pub term: Term,
    pub success: bool,
    pub conflict_index: LogIndex,
    pub conflict_term: Term,
}

/// An outbound RPC produced by the consensus core, to be handed to the
/// transport.
#[derive(Clone, Debug, PartialEq)]
pub enum Outbound {
    Vote {
        to: NodeId,
        request: RequestVote,
    },
    Append {
        to: NodeId,
        /// Per-peer monotone sequence number; the transport carries it as
        /// the frame correlation id and the leader uses it to credit
        /// exactly the entries this request carried.
        seq: u64,
        request: AppendEntries,
    },
}

impl fmt::Display for RequestVote {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("RequestVote")
            .field("term", &self.term)
            .field("candidate", &self.candidate_id)
            .field("last_log_index", &self.last_log_index)
            .field("last_log_term", &self.last_log_term)
            .finish()
    }
}

impl fmt::Display for AppendEntries {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("AppendEntries")
            .field("term", &self.term)
            .field("leader", &self.leader_id)
            .field("prev_log_index", &self.prev_log_index)
            .field("prev_log_term", &self.prev_log_term)
            .field("entries", &self.entries.len())
            .field("leader_commit", &self.leader_commit)
            .finish()
    }
}

impl fmt::Display for AppendEntriesResponse {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("AppendEntriesResponse")
            .field("term", &self.term)
            .field("success", &self.success)
            .field("conflict_index", &self.conflict_index)
            .field("conflict_term", &self.conflict_term)
            .finish()
    }
}
