//! Thread-safe wrapper around the consensus core.
//!
//! [`RaftNode`] owns the [`core::State`](crate::core::State) behind one
//! coarse mutex; every public entry point takes it. Outbound RPCs are
//! handed to the [`Transport`] while the lock is held, so transport sends
//! must be non-blocking — enqueue and let dedicated threads do the I/O.
//! Committed entries are pushed into the [`StateMachine`] from the same
//! entry points, in strictly increasing index order.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use std::time::Instant;

use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use log::error;
use rand_core::RngCore;

use crate::cluster::ClusterConfig;
use crate::core::State;
use crate::log::LogStore;
use crate::message::{
    AppendEntries, AppendEntriesResponse, CommandType, LogEntry, LogIndex, NodeId, Outbound,
    RequestVote, RequestVoteResponse, Term,
};

/// Configurable timing and batching parameters of a node.
///
/// All peers of a cluster must run with the same configuration.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Config {
    /// Lower bound of the randomized election timeout.
    pub election_timeout_min_ms: u64,
    /// Upper bound of the randomized election timeout.
    pub election_timeout_max_ms: u64,
    /// Interval between leader heartbeats.
    pub heartbeat_interval_ms: u64,
    /// How long an unacknowledged AppendEntries stays outstanding before
    /// it is retransmitted.
    pub rpc_timeout_ms: u64,
    /// Maximum entries carried by one AppendEntries.
    pub max_entries_per_rpc: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            election_timeout_min_ms: 150,
            election_timeout_max_ms: 300,
            heartbeat_interval_ms: 50,
            rpc_timeout_ms: 100,
            max_entries_per_rpc: 100,
        }
    }
}

/// The role a node currently plays in its cluster.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

impl fmt::Display for Role {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Follower => fmt.write_str("follower"),
            Role::Candidate => fmt.write_str("candidate"),
            Role::Leader => fmt.write_str("leader"),
        }
    }
}

/// Point-in-time view of a node's volatile state.
#[derive(Clone, Copy, Debug)]
pub struct NodeStatus {
    pub role: Role,
    pub term: Term,
    pub leader_hint: Option<NodeId>,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    pub last_log_index: LogIndex,
}

/// Outbound side of the RPC layer as seen by the node.
///
/// Both sends are fire-and-forget: failures are dropped and the next
/// heartbeat retries. Implementations must not block; they are called with
/// the node mutex held.
pub trait Transport: Send + Sync {
    fn send_request_vote(&self, to: NodeId, request: RequestVote);
    fn send_append_entries(&self, to: NodeId, seq: u64, request: AppendEntries);
}

/// The replicated state machine fed by committed log entries.
pub trait StateMachine: Send {
    /// Result of applying one entry, delivered to the submitter.
    type Output: Send;

    /// Applies a committed entry. Entries arrive exactly once, in strictly
    /// increasing index order; re-applying an index must be a no-op.
    fn apply(&self, entry: &LogEntry) -> Self::Output;
}

impl<M: StateMachine + Sync> StateMachine for std::sync::Arc<M> {
    type Output = M::Output;

    fn apply(&self, entry: &LogEntry) -> Self::Output {
        M::apply(self, entry)
    }
}

/// Why a submitted command will not produce a result.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SubmitError {
    /// This node is not the leader; retry against `leader_hint` if given.
    NotLeader { leader_hint: Option<NodeId> },
    /// A different entry was committed at the index this command was
    /// appended to; resubmit to the current leader.
    Cancelled,
    /// The node's durable storage failed; the node no longer participates.
    Storage(String),
    /// The command did not commit within the waiter's deadline.
    Timeout,
    /// The node has been stopped or has failed.
    NotRunning,
}

impl fmt::Display for SubmitError {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubmitError::NotLeader { leader_hint: Some(id) } => {
                write!(fmt, "not leader (try node {})", id)
            }
            SubmitError::NotLeader { leader_hint: None } => write!(fmt, "not leader"),
            SubmitError::Cancelled => write!(fmt, "entry overwritten before commit"),
            SubmitError::Storage(err) => write!(fmt, "storage failure: {}", err),
            SubmitError::Timeout => write!(fmt, "timed out waiting for commit"),
            SubmitError::NotRunning => write!(fmt, "node not running"),
        }
    }
}

impl std::error::Error for SubmitError {}

/// A command accepted by the leader, resolving once the entry commits and
/// applies.
pub struct SubmitTicket<O> {
    pub term: Term,
    pub index: LogIndex,
    pub outcome: Receiver<Result<O, SubmitError>>,
}

struct Waiter<O> {
    term: Term,
    tx: Sender<Result<O, SubmitError>>,
}

struct Inner<L: LogStore, M: StateMachine, R> {
    state: State<L, R>,
    machine: M,
    pending: HashMap<LogIndex, Waiter<M::Output>>,
    failed: bool,
}

/// A Raft node: the consensus core, its state machine and its transport,
/// behind one mutex.
pub struct RaftNode<L: LogStore, M: StateMachine, T, R> {
    inner: Mutex<Inner<L, M, R>>,
    transport: T,
    started_at: Instant,
}

impl<L, M, T, R> RaftNode<L, M, T, R>
where
    L: LogStore,
    M: StateMachine,
    T: Transport,
    R: RngCore,
{
    /// Builds a node from recovered persistent state; `log` already holds
    /// the recovered entries.
    pub fn new(
        node_id: NodeId,
        cluster: ClusterConfig,
        log: L,
        machine: M,
        transport: T,
        random: R,
        config: Config,
        current_term: Term,
        voted_for: Option<NodeId>,
    ) -> Self {
        let started_at = Instant::now();
        let state = State::new(
            node_id, cluster, log, random, config, current_term, voted_for, 0,
        );
        RaftNode {
            inner: Mutex::new(Inner {
                state,
                machine,
                pending: HashMap::new(),
                failed: false,
            }),
            transport,
            started_at,
        }
    }

    fn now_ms(&self) -> u64 {
        self.started_at.elapsed().as_millis() as u64
    }

    /// Drives timeouts, heartbeats and the apply loop. Called by the
    /// driver thread roughly every 10 ms.
    pub fn tick(&self) {
        let now_ms = self.now_ms();
        let mut inner = self.inner.lock().unwrap();
        if inner.failed {
            return;
        }
        match inner.state.tick(now_ms) {
            Ok(outbound) => self.dispatch(outbound),
            Err(err) => Self::storage_failure(&mut inner, &err),
        }
        self.apply_committed(&mut inner);
    }

    /// Peer RPC: RequestVote. Returns `None` once the node has failed.
    pub fn handle_request_vote(&self, request: &RequestVote) -> Option<RequestVoteResponse> {
        let now_ms = self.now_ms();
        let mut inner = self.inner.lock().unwrap();
        if inner.failed {
            return None;
        }
        match inner.state.handle_request_vote(request, now_ms) {
            Ok(response) => Some(response),
            Err(err) => {
                Self::storage_failure(&mut inner, &err);
                None
            }
        }
    }

    /// Peer RPC: AppendEntries. Returns `None` once the node has failed.
    pub fn handle_append_entries(&self, request: &AppendEntries) -> Option<AppendEntriesResponse> {
        let now_ms = self.now_ms();
        let mut inner = self.inner.lock().unwrap();
        if inner.failed {
            return None;
        }
        let response = match inner.state.handle_append_entries(request, now_ms) {
            Ok(response) => response,
            Err(err) => {
                Self::storage_failure(&mut inner, &err);
                return None;
            }
        };
        self.apply_committed(&mut inner);
        Some(response)
    }

    /// Transport callback: a RequestVote response arrived from `from`.
    pub fn handle_request_vote_response(&self, from: NodeId, response: &RequestVoteResponse) {
        let now_ms = self.now_ms();
        let mut inner = self.inner.lock().unwrap();
        if inner.failed {
            return;
        }
        match inner.state.handle_request_vote_response(from, response, now_ms) {
            Ok(outbound) => self.dispatch(outbound),
            Err(err) => Self::storage_failure(&mut inner, &err),
        }
    }

    /// Transport callback: an AppendEntries response arrived from `from`.
    pub fn handle_append_entries_response(
        &self,
        from: NodeId,
        seq: u64,
        response: &AppendEntriesResponse,
    ) {
        let now_ms = self.now_ms();
        let mut inner = self.inner.lock().unwrap();
        if inner.failed {
            return;
        }
        match inner
            .state
            .handle_append_entries_response(from, seq, response, now_ms)
        {
            Ok(outbound) => self.dispatch(outbound),
            Err(err) => Self::storage_failure(&mut inner, &err),
        }
        self.apply_committed(&mut inner);
    }

    /// Submits a client command. On the leader the returned ticket resolves
    /// with the state machine's output once the entry is committed and
    /// applied.
    pub fn submit(
        &self,
        command_type: CommandType,
        data: Bytes,
    ) -> Result<SubmitTicket<M::Output>, SubmitError> {
        let now_ms = self.now_ms();
        let mut inner = self.inner.lock().unwrap();
        if inner.failed {
            return Err(SubmitError::NotRunning);
        }
        match inner.state.submit(command_type, data, now_ms) {
            Ok(Some((term, index, outbound))) => {
                let (tx, rx) = bounded(1);
                inner.pending.insert(index, Waiter { term, tx });
                self.dispatch(outbound);
                self.apply_committed(&mut inner);
                Ok(SubmitTicket {
                    term,
                    index,
                    outcome: rx,
                })
            }
            Ok(None) => Err(SubmitError::NotLeader {
                leader_hint: inner.state.leader_hint(),
            }),
            Err(err) => {
                Self::storage_failure(&mut inner, &err);
                Err(SubmitError::Storage(err.to_string()))
            }
        }
    }

    pub fn is_leader(&self) -> bool {
        self.inner.lock().unwrap().state.is_leader()
    }

    pub fn current_term(&self) -> Term {
        self.inner.lock().unwrap().state.current_term()
    }

    pub fn leader_hint(&self) -> Option<NodeId> {
        self.inner.lock().unwrap().state.leader_hint()
    }

    pub fn status(&self) -> NodeStatus {
        let inner = self.inner.lock().unwrap();
        NodeStatus {
            role: inner.state.role(),
            term: inner.state.current_term(),
            leader_hint: inner.state.leader_hint(),
            commit_index: inner.state.commit_index(),
            last_applied: inner.state.last_applied(),
            last_log_index: inner.state.log().last_index(),
        }
    }

    /// Whether durable storage has failed and the node stopped
    /// participating.
    pub fn has_failed(&self) -> bool {
        self.inner.lock().unwrap().failed
    }

    fn dispatch(&self, outbound: Vec<Outbound>) {
        for message in outbound {
            match message {
                Outbound::Vote { to, request } => self.transport.send_request_vote(to, request),
                Outbound::Append { to, seq, request } => {
                    self.transport.send_append_entries(to, seq, request)
                }
            }
        }
    }

    fn apply_committed(&self, inner: &mut Inner<L, M, R>) {
        for entry in inner.state.take_applicable() {
            let output = inner.machine.apply(&entry);
            if let Some(waiter) = inner.pending.remove(&entry.index) {
                let result = if waiter.term == entry.term {
                    Ok(output)
                } else {
                    Err(SubmitError::Cancelled)
                };
                let _ = waiter.tx.send(result);
            }
        }
    }

    fn storage_failure(inner: &mut Inner<L, M, R>, err: &L::Error) {
        error!("log storage failure, node leaving the cluster: {}", err);
        inner.failed = true;
        for (_, waiter) in inner.pending.drain() {
            let _ = waiter.tx.send(Err(SubmitError::Storage(err.to_string())));
        }
    }
}

impl<O> SubmitTicket<O> {
    /// Blocks until the command resolves or `timeout_ms` elapses.
    pub fn wait_ms(self, timeout_ms: u64) -> Result<O, SubmitError> {
        match self
            .outcome
            .recv_timeout(std::time::Duration::from_millis(timeout_ms))
        {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(SubmitError::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(SubmitError::NotRunning),
        }
    }
}
