//! A replicated state-machine engine implementing the Raft consensus
//! protocol: leader-based total ordering of commands, majority-quorum
//! durability before commit, safe leader election, and log compaction
//! through snapshots.
//!
//! The crate provides the per-server consensus core. The network transport,
//! the application state machine and the command registry are collaborators
//! supplied through the [`Transporter`], [`StateMachine`], [`Command`] and
//! [`CommandRegistry`] traits.

pub mod entry;
pub mod error;
mod event;
pub mod message;
pub mod peer;
pub mod raft_log;
pub mod server;
pub mod snapshot;
pub mod state_machine;
pub mod transport;

pub use entry::LogEntry;
pub use error::{Error, Result};
pub use raft_log::{ApplyFunc, Log};
pub use message::{
    AppendEntriesRequest, AppendEntriesResponse, RequestVoteRequest, RequestVoteResponse,
    SnapshotRequest, SnapshotResponse,
};
pub use peer::Peer;
pub use server::{
    Server, ServerState, DEFAULT_ELECTION_TIMEOUT, DEFAULT_HEARTBEAT_TIMEOUT,
    DEFAULT_SNAPSHOT_INTERVAL,
};
pub use snapshot::Snapshot;
pub use state_machine::{Command, CommandRegistry, StateMachine};
pub use transport::Transporter;
