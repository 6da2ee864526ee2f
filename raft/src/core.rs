//! Low-level state machine for a single Raft node.
//!
//! [`State`] is deterministic and performs no I/O: time enters as a
//! millisecond `now_ms` argument, randomness through the generic `RngCore`,
//! and durability through the [`LogStore`]. Every handler persists the
//! term/vote/log state a reply depends on before that reply is returned.

use std::collections::{BTreeMap, BTreeSet};

use bytes::Bytes;
use log::{debug, info, warn};
use rand_core::RngCore;

use crate::cluster::{majority, ClusterConfig};
use crate::log::LogStore;
use crate::message::{
    AppendEntries, AppendEntriesResponse, CommandType, LogEntry, LogIndex, NodeId, Outbound,
    RequestVote, RequestVoteResponse, Term,
};
use crate::node::{Config, Role};

use self::LeadershipState::*;

/// Leader-side replication bookkeeping for one peer.
#[derive(Clone, Copy, Debug)]
pub struct PeerState {
    /// Index of the next log entry to send to this peer.
    pub next_index: LogIndex,
    /// Highest index known to be replicated on this peer.
    pub match_index: LogIndex,
    /// The one outstanding AppendEntries, if any.
    pub inflight: Option<Inflight>,
    /// Last time a response arrived from this peer.
    pub last_contact_ms: u64,
}

/// Exact contents of an unacknowledged AppendEntries. On a success
/// response carrying the matching `seq`, the leader advances `match_index`
/// to `prev_log_index + entries_len` — never more than what was actually
/// sent.
#[derive(Clone, Copy, Debug)]
pub struct Inflight {
    pub seq: u64,
    pub prev_log_index: LogIndex,
    pub entries_len: u64,
    pub sent_at_ms: u64,
}

enum LeadershipState {
    Follower(FollowerState),
    Candidate(CandidateState),
    Leader(LeaderState),
}

struct FollowerState {
    leader: Option<NodeId>,
    election_deadline_ms: u64,
}

struct CandidateState {
    votes_granted: BTreeSet<NodeId>,
    election_deadline_ms: u64,
}

struct LeaderState {
    peers: BTreeMap<NodeId, PeerState>,
    heartbeat_due_ms: u64,
}

/// The complete state of one Raft node.
pub struct State<L, R> {
    node_id: NodeId,
    cluster: ClusterConfig,
    config: Config,
    random: R,
    log: L,

    current_term: Term,
    voted_for: Option<NodeId>,
    leadership: LeadershipState,

    commit_index: LogIndex,
    last_applied: LogIndex,
    seq_counter: u64,
}

impl<L, R> State<L, R>
where
    L: LogStore,
    R: RngCore,
{
    /// Constructs a node from recovered persistent state. `log` must
    /// already hold the recovered entries; `current_term` and `voted_for`
    /// come from the same recovery.
    pub fn new(
        node_id: NodeId,
        cluster: ClusterConfig,
        log: L,
        random: R,
        config: Config,
        current_term: Term,
        voted_for: Option<NodeId>,
        now_ms: u64,
    ) -> Self {
        let mut state = State {
            node_id,
            cluster,
            config,
            random,
            log,
            current_term,
            voted_for,
            leadership: Follower(FollowerState {
                leader: None,
                election_deadline_ms: 0,
            }),
            commit_index: 0,
            last_applied: 0,
            seq_counter: 0,
        };
        let deadline = state.next_election_deadline(now_ms);
        if let Follower(follower) = &mut state.leadership {
            follower.election_deadline_ms = deadline;
        }
        state
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn current_term(&self) -> Term {
        self.current_term
    }

    pub fn voted_for(&self) -> Option<NodeId> {
        self.voted_for
    }

    pub fn commit_index(&self) -> LogIndex {
        self.commit_index
    }

    pub fn last_applied(&self) -> LogIndex {
        self.last_applied
    }

    pub fn cluster(&self) -> &ClusterConfig {
        &self.cluster
    }

    pub fn log(&self) -> &L {
        &self.log
    }

    pub fn log_mut(&mut self) -> &mut L {
        &mut self.log
    }

    pub fn is_leader(&self) -> bool {
        matches!(self.leadership, Leader(_))
    }

    pub fn role(&self) -> Role {
        match self.leadership {
            Follower(_) => Role::Follower,
            Candidate(_) => Role::Candidate,
            Leader(_) => Role::Leader,
        }
    }

    /// The node believed to be leader of the current term, if any.
    pub fn leader_hint(&self) -> Option<NodeId> {
        match &self.leadership {
            Follower(follower) => follower.leader,
            Candidate(_) => None,
            Leader(_) => Some(self.node_id),
        }
    }

    /// Leader-side replication state for `peer`, if this node leads.
    pub fn replication_state(&self, peer: NodeId) -> Option<&PeerState> {
        match &self.leadership {
            Leader(leader) => leader.peers.get(&peer),
            _ => None,
        }
    }

    /// Advances the node's clock. Drives election timeouts on followers
    /// and candidates and the 50 ms heartbeat cadence on leaders.
    pub fn tick(&mut self, now_ms: u64) -> Result<Vec<Outbound>, L::Error> {
        match &mut self.leadership {
            Follower(FollowerState {
                election_deadline_ms,
                ..
            })
            | Candidate(CandidateState {
                election_deadline_ms,
                ..
            }) => {
                if now_ms >= *election_deadline_ms {
                    info!("election timeout at term {}", self.current_term);
                    return self.start_election(now_ms);
                }
                Ok(Vec::new())
            }
            Leader(leader) => {
                if now_ms >= leader.heartbeat_due_ms {
                    leader.heartbeat_due_ms = now_ms + self.config.heartbeat_interval_ms;
                    self.replicate_all(now_ms, true)
                } else {
                    Ok(Vec::new())
                }
            }
        }
    }

    /// Starts a new election: bump the term, vote for ourselves (durably),
    /// and solicit the peers. Single-node clusters promote immediately.
    pub fn start_election(&mut self, now_ms: u64) -> Result<Vec<Outbound>, L::Error> {
        if self.is_leader() {
            return Ok(Vec::new());
        }
        self.current_term += 1;
        self.voted_for = Some(self.node_id);
        self.log.save_vote(self.current_term, self.node_id)?;
        self.log.sync()?;

        let mut votes_granted = BTreeSet::new();
        votes_granted.insert(self.node_id);
        if self.cluster.has_quorum(&votes_granted) {
            return self.become_leader(now_ms);
        }

        info!("became candidate at term {}", self.current_term);
        let election_deadline_ms = self.next_election_deadline(now_ms);
        self.leadership = Candidate(CandidateState {
            votes_granted,
            election_deadline_ms,
        });

        let request = RequestVote {
            term: self.current_term,
            candidate_id: self.node_id,
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
        };
        Ok(self
            .cluster
            .peers_of(self.node_id)
            .map(|to| Outbound::Vote {
                to,
                request: request.clone(),
            })
            .collect())
    }

    /// RequestVote handler.
    pub fn handle_request_vote(
        &mut self,
        request: &RequestVote,
        now_ms: u64,
    ) -> Result<RequestVoteResponse, L::Error> {
        if request.term > self.current_term {
            self.step_down(request.term, now_ms)?;
        }

        let last_log_index = self.log.last_index();
        let last_log_term = self.log.last_term();
        let log_ok = request.last_log_term > last_log_term
            || (request.last_log_term == last_log_term
                && request.last_log_index >= last_log_index);
        let grant = request.term == self.current_term
            && log_ok
            && self
                .voted_for
                .map_or(true, |vote| vote == request.candidate_id);

        if grant {
            if self.voted_for != Some(request.candidate_id) {
                self.voted_for = Some(request.candidate_id);
                self.log.save_vote(self.current_term, request.candidate_id)?;
                self.log.sync()?;
            }
            info!(
                "granted vote to node {} at term {}",
                request.candidate_id, self.current_term
            );
            let deadline = self.next_election_deadline(now_ms);
            if let Follower(follower) = &mut self.leadership {
                follower.election_deadline_ms = deadline;
            }
        } else if request.term < self.current_term {
            debug!(
                "rejected vote for node {}: stale term {} < {}",
                request.candidate_id, request.term, self.current_term
            );
        } else if let Some(vote) = self.voted_for {
            debug!(
                "rejected vote for node {} at term {}: already voted for {}",
                request.candidate_id, self.current_term, vote
            );
        } else {
            debug!(
                "rejected vote for node {} at term {}: log behind ours ({} at {})",
                request.candidate_id, self.current_term, last_log_index, last_log_term
            );
        }

        Ok(RequestVoteResponse {
            term: self.current_term,
            vote_granted: grant,
        })
    }

    /// RequestVote response handler.
    pub fn handle_request_vote_response(
        &mut self,
        from: NodeId,
        response: &RequestVoteResponse,
        now_ms: u64,
    ) -> Result<Vec<Outbound>, L::Error> {
        if response.term > self.current_term {
            self.step_down(response.term, now_ms)?;
            return Ok(Vec::new());
        }
        if response.term < self.current_term {
            debug!(
                "ignored vote response from {} with stale term {}",
                from, response.term
            );
            return Ok(Vec::new());
        }
        if let Candidate(candidate) = &mut self.leadership {
            if response.vote_granted && self.cluster.contains(from) {
                info!("vote granted by node {} at term {}", from, self.current_term);
                candidate.votes_granted.insert(from);
                if self.cluster.has_quorum(&candidate.votes_granted) {
                    return self.become_leader(now_ms);
                }
            } else if !response.vote_granted {
                debug!("vote denied by node {} at term {}", from, self.current_term);
            }
        }
        Ok(Vec::new())
    }

    /// AppendEntries handler: consistency check with conflict hints,
    /// truncate-and-append, and commit index adoption.
    pub fn handle_append_entries(
        &mut self,
        request: &AppendEntries,
        now_ms: u64,
    ) -> Result<AppendEntriesResponse, L::Error> {
        if request.term < self.current_term {
            debug!(
                "rejected append from {}: stale term {} < {}",
                request.leader_id, request.term, self.current_term
            );
            return Ok(AppendEntriesResponse {
                term: self.current_term,
                success: false,
                conflict_index: 0,
                conflict_term: 0,
            });
        }
        if request.term > self.current_term {
            self.step_down(request.term, now_ms)?;
        }

        // A valid leader for this term; follow it and reset the timer.
        if let Leader(_) = self.leadership {
            warn!(
                "append from {} while leading term {}; stepping down",
                request.leader_id, self.current_term
            );
        }
        let election_deadline_ms = self.next_election_deadline(now_ms);
        match &mut self.leadership {
            Follower(follower) => {
                if follower.leader != Some(request.leader_id) {
                    info!(
                        "following node {} at term {}",
                        request.leader_id, self.current_term
                    );
                }
                follower.leader = Some(request.leader_id);
                follower.election_deadline_ms = election_deadline_ms;
            }
            Candidate(_) | Leader(_) => {
                info!(
                    "following node {} at term {}",
                    request.leader_id, self.current_term
                );
                self.leadership = Follower(FollowerState {
                    leader: Some(request.leader_id),
                    election_deadline_ms,
                });
            }
        }

        if request.prev_log_index > 0 {
            match self.log.term_at(request.prev_log_index) {
                None => {
                    // Log too short to contain the previous entry.
                    debug!(
                        "rejected append from {}: log ends at {} before {}",
                        request.leader_id,
                        self.log.last_index(),
                        request.prev_log_index
                    );
                    return Ok(AppendEntriesResponse {
                        term: self.current_term,
                        success: false,
                        conflict_index: self.log.last_index() + 1,
                        conflict_term: 0,
                    });
                }
                Some(term) if term != request.prev_log_term => {
                    let mut conflict_index = request.prev_log_index;
                    while conflict_index > 1
                        && self.log.term_at(conflict_index - 1) == Some(term)
                    {
                        conflict_index -= 1;
                    }
                    debug!(
                        "rejected append from {}: term {} at {} (leader has {})",
                        request.leader_id, term, request.prev_log_index, request.prev_log_term
                    );
                    return Ok(AppendEntriesResponse {
                        term: self.current_term,
                        success: false,
                        conflict_index,
                        conflict_term: term,
                    });
                }
                Some(_) => {}
            }
        }

        // Entries must sit contiguously after prev_log_index.
        for (offset, entry) in request.entries.iter().enumerate() {
            if entry.index != request.prev_log_index + 1 + offset as u64 {
                warn!(
                    "append from {} carries non-contiguous entry {} (expected {})",
                    request.leader_id,
                    entry.index,
                    request.prev_log_index + 1 + offset as u64
                );
                return Ok(AppendEntriesResponse {
                    term: self.current_term,
                    success: false,
                    conflict_index: self.log.last_index() + 1,
                    conflict_term: 0,
                });
            }
        }

        let mut appended = false;
        for entry in &request.entries {
            let index = entry.index;
            if index <= self.log.last_index() {
                if self.log.term_at(index) == Some(entry.term) {
                    continue;
                }
                if index <= self.commit_index {
                    // Never truncate committed entries.
                    warn!(
                        "append from {} conflicts at committed index {}",
                        request.leader_id, index
                    );
                    return Ok(AppendEntriesResponse {
                        term: self.current_term,
                        success: false,
                        conflict_index: self.log.last_index() + 1,
                        conflict_term: 0,
                    });
                }
                let removed = self.log.truncate_from(index)?;
                info!("truncated {} conflicting entries from {}", removed, index);
            }
            self.log.append(entry.clone())?;
            appended = true;
        }
        if appended {
            self.log.sync()?;
        }

        if request.leader_commit > self.commit_index {
            self.commit_index = request.leader_commit.min(self.log.last_index());
        }

        Ok(AppendEntriesResponse {
            term: self.current_term,
            success: true,
            conflict_index: 0,
            conflict_term: 0,
        })
    }

    /// AppendEntries response handler. `seq` identifies which outstanding
    /// request this response answers; responses for anything else only
    /// contribute their term.
    pub fn handle_append_entries_response(
        &mut self,
        from: NodeId,
        seq: u64,
        response: &AppendEntriesResponse,
        now_ms: u64,
    ) -> Result<Vec<Outbound>, L::Error> {
        if response.term > self.current_term {
            self.step_down(response.term, now_ms)?;
            return Ok(Vec::new());
        }
        if response.term < self.current_term || !self.is_leader() {
            debug!("ignored append response from {} at term {}", from, response.term);
            return Ok(Vec::new());
        }

        let mut acknowledged = false;
        if let Leader(leader) = &mut self.leadership {
            let peer = match leader.peers.get_mut(&from) {
                Some(peer) => peer,
                None => return Ok(Vec::new()),
            };
            let inflight = match peer.inflight {
                Some(inflight) if inflight.seq == seq => inflight,
                _ => {
                    debug!("ignored stale append response from {} (seq {})", from, seq);
                    return Ok(Vec::new());
                }
            };
            peer.inflight = None;
            peer.last_contact_ms = now_ms;

            if response.success {
                let acked = inflight.prev_log_index + inflight.entries_len;
                if acked > peer.match_index {
                    peer.match_index = acked;
                }
                if acked + 1 > peer.next_index {
                    peer.next_index = acked + 1;
                }
                acknowledged = true;
            } else {
                let next_index = if response.conflict_term > 0 {
                    // Jump past our last entry of the conflicting term if we
                    // have one, else to the follower's first entry of it.
                    let mut scan = inflight.prev_log_index;
                    let mut last_of_term = 0;
                    while scan > 0 {
                        match self.log.term_at(scan) {
                            Some(term) if term == response.conflict_term => {
                                last_of_term = scan;
                                break;
                            }
                            Some(term) if term < response.conflict_term => break,
                            _ => scan -= 1,
                        }
                    }
                    if last_of_term > 0 {
                        last_of_term + 1
                    } else {
                        response.conflict_index
                    }
                } else {
                    response.conflict_index
                };
                peer.next_index = next_index.max(1).max(peer.match_index + 1);
                debug!("backing up node {} to next_index {}", from, peer.next_index);
            }
        }

        if acknowledged {
            self.advance_commit_index();
        }
        // Keep the pipe full: more entries after a success, a probe after a
        // rejection.
        match self.replicate(from, now_ms, !acknowledged)? {
            Some(outbound) => Ok(vec![outbound]),
            None => Ok(Vec::new()),
        }
    }

    /// Appends a client command to the leader's log. Returns `None` on a
    /// non-leader, otherwise the assigned `(term, index)` and the
    /// replication messages to send.
    pub fn submit(
        &mut self,
        command_type: CommandType,
        data: Bytes,
        now_ms: u64,
    ) -> Result<Option<(Term, LogIndex, Vec<Outbound>)>, L::Error> {
        if !self.is_leader() {
            return Ok(None);
        }
        let index = self.log.last_index() + 1;
        let term = self.current_term;
        self.log.append(LogEntry {
            term,
            index,
            command_type,
            data,
        })?;
        self.log.sync()?;
        self.advance_commit_index();
        let outbound = self.replicate_all(now_ms, false)?;
        Ok(Some((term, index, outbound)))
    }

    /// Entries newly eligible for the state machine, in index order. Each
    /// entry is returned exactly once.
    pub fn take_applicable(&mut self) -> Vec<LogEntry> {
        let mut entries = Vec::new();
        while self.last_applied < self.commit_index {
            let index = self.last_applied + 1;
            match self.log.entry(index) {
                Some(entry) => entries.push(entry.clone()),
                None => {
                    warn!("commit index {} ahead of log end", self.commit_index);
                    break;
                }
            }
            self.last_applied = index;
        }
        entries
    }

    fn become_leader(&mut self, now_ms: u64) -> Result<Vec<Outbound>, L::Error> {
        info!("became leader at term {}", self.current_term);
        let next_index = self.log.last_index() + 1;
        let peers = self
            .cluster
            .peers_of(self.node_id)
            .map(|id| {
                (
                    id,
                    PeerState {
                        next_index,
                        match_index: 0,
                        inflight: None,
                        last_contact_ms: now_ms,
                    },
                )
            })
            .collect();
        self.leadership = Leader(LeaderState {
            peers,
            heartbeat_due_ms: now_ms + self.config.heartbeat_interval_ms,
        });

        // A no-op in the new term lets prior-term entries commit through
        // the current-term counting rule.
        let index = self.log.last_index() + 1;
        self.log.append(LogEntry {
            term: self.current_term,
            index,
            command_type: CommandType::Noop,
            data: Bytes::new(),
        })?;
        self.log.sync()?;
        self.advance_commit_index();
        self.replicate_all(now_ms, true)
    }

    /// Observed a higher term: adopt it durably and fall back to follower.
    fn step_down(&mut self, term: Term, now_ms: u64) -> Result<(), L::Error> {
        info!(
            "stepping down to follower at term {} (from {})",
            term, self.current_term
        );
        self.current_term = term;
        self.voted_for = None;
        self.log.save_term(term)?;
        self.log.sync()?;
        self.leadership = Follower(FollowerState {
            leader: None,
            election_deadline_ms: self.next_election_deadline(now_ms),
        });
        Ok(())
    }

    /// Builds one AppendEntries for `peer_id` if nothing is outstanding (or
    /// the outstanding request timed out). With `force`, sends even when
    /// there are no new entries, as a heartbeat or probe.
    fn replicate(
        &mut self,
        peer_id: NodeId,
        now_ms: u64,
        force: bool,
    ) -> Result<Option<Outbound>, L::Error> {
        let term = self.current_term;
        let node_id = self.node_id;
        let commit_index = self.commit_index;
        let rpc_timeout_ms = self.config.rpc_timeout_ms;
        let max_entries = self.config.max_entries_per_rpc;
        self.seq_counter += 1;
        let seq = self.seq_counter;

        let log = &self.log;
        let leader = match &mut self.leadership {
            Leader(leader) => leader,
            _ => return Ok(None),
        };
        let peer = match leader.peers.get_mut(&peer_id) {
            Some(peer) => peer,
            None => return Ok(None),
        };

        if let Some(inflight) = peer.inflight {
            if now_ms.saturating_sub(inflight.sent_at_ms) < rpc_timeout_ms {
                return Ok(None);
            }
            debug!("retransmitting to node {} after rpc timeout", peer_id);
        }

        let next_index = peer.next_index.max(1);
        let prev_log_index = next_index - 1;
        let prev_log_term = match log.term_at(prev_log_index) {
            Some(term) => term,
            None => {
                warn!("no term for prev index {} of node {}", prev_log_index, peer_id);
                return Ok(None);
            }
        };
        let entries = log.entries_from(next_index, max_entries);
        if entries.is_empty() && !force {
            return Ok(None);
        }

        peer.inflight = Some(Inflight {
            seq,
            prev_log_index,
            entries_len: entries.len() as u64,
            sent_at_ms: now_ms,
        });
        Ok(Some(Outbound::Append {
            to: peer_id,
            seq,
            request: AppendEntries {
                term,
                leader_id: node_id,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit: commit_index,
            },
        }))
    }

    fn replicate_all(&mut self, now_ms: u64, force: bool) -> Result<Vec<Outbound>, L::Error> {
        let peers: Vec<NodeId> = match &self.leadership {
            Leader(leader) => leader.peers.keys().cloned().collect(),
            _ => return Ok(Vec::new()),
        };
        let mut outbound = Vec::with_capacity(peers.len());
        for peer in peers {
            if let Some(message) = self.replicate(peer, now_ms, force)? {
                outbound.push(message);
            }
        }
        Ok(outbound)
    }

    /// Leader commit rule: the highest index replicated on a quorum, only
    /// counted when its entry carries the current term.
    fn advance_commit_index(&mut self) {
        let candidate = match &self.leadership {
            Leader(leader) => {
                let group_commit = |members: &BTreeSet<NodeId>| {
                    let mut matches: Vec<LogIndex> = members
                        .iter()
                        .map(|id| {
                            if *id == self.node_id {
                                self.log.last_index()
                            } else {
                                leader.peers.get(id).map_or(0, |peer| peer.match_index)
                            }
                        })
                        .collect();
                    matches.sort_unstable_by(|a, b| b.cmp(a));
                    matches
                        .get(majority(members.len()).saturating_sub(1))
                        .copied()
                        .unwrap_or(0)
                };
                let mut candidate = group_commit(&self.cluster.nodes);
                if let Some(old) = &self.cluster.old_nodes {
                    candidate = candidate.min(group_commit(old));
                }
                candidate
            }
            _ => return,
        };

        if candidate > self.commit_index && self.log.term_at(candidate) == Some(self.current_term)
        {
            debug!(
                "advanced commit index from {} to {}",
                self.commit_index, candidate
            );
            self.commit_index = candidate;
        }
    }

    fn next_election_deadline(&mut self, now_ms: u64) -> u64 {
        let min = self.config.election_timeout_min_ms;
        let max = self.config.election_timeout_max_ms;
        let span = max.saturating_sub(min);
        let jitter = if span == 0 {
            0
        } else {
            self.random.next_u64() % (span + 1)
        };
        now_ms + min + jitter
    }
}
