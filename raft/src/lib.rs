//! Raft consensus for a replicated key-value log.
//!
//! This crate implements the Raft consensus algorithm as a deterministic
//! state machine driven from the outside:
//!
//! * Every ~10 ms the driver calls [`RaftNode::tick`](node::RaftNode::tick).
//! * Peer RPCs arriving from the network are fed into the `handle_*`
//!   methods of [`RaftNode`](node::RaftNode).
//! * Client commands enter through [`submit`](node::RaftNode::submit) and
//!   resolve once the entry is committed and applied.
//!
//! The low-level state machine lives in [`core::State`] and performs no I/O
//! of its own: durable storage is abstracted behind [`log::LogStore`]
//! (persisting entries, votes and term updates before the messages that
//! depend on them are released), outbound RPCs behind
//! [`node::Transport`], and command application behind
//! [`node::StateMachine`]. [`core::State`] is single-threaded and generic
//! over its random source, which keeps cluster behavior fully
//! reproducible in tests; [`node::RaftNode`] wraps it in the one coarse
//! mutex every public entry point takes.
//!
//! Cluster membership is fixed at startup. Log compaction and snapshot
//! shipping are not implemented.

#![allow(unused_parens)]

pub mod cluster;
pub mod core;
pub mod log;
pub mod message;
pub mod node;
