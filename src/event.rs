//! Events delivered on the server's single event channel.

use tokio::sync::oneshot;

use crate::message::{
    AppendEntriesRequest, AppendEntriesResponse, RequestVoteRequest, RequestVoteResponse,
};
use crate::state_machine::Command;
use crate::Result;

/// One unit of work for the role loops. Every mutation of consensus state
/// flows through exactly one of these variants; the reply halves are
/// one-shot channels back to whoever enqueued the event.
pub(crate) enum Event {
    /// Stop sentinel: the active role loop transitions to Stopped.
    Stop,
    /// A client command to replicate and apply.
    Command {
        command: Box<dyn Command>,
        reply: oneshot::Sender<Result<Vec<u8>>>,
    },
    /// An inbound AppendEntries RPC.
    AppendEntries {
        req: AppendEntriesRequest,
        reply: oneshot::Sender<AppendEntriesResponse>,
    },
    /// A peer's response to a replication round (or the leader's synthetic
    /// self-acknowledgement).
    AppendEntriesResponse(AppendEntriesResponse),
    /// An inbound RequestVote RPC.
    RequestVote {
        req: RequestVoteRequest,
        reply: oneshot::Sender<RequestVoteResponse>,
    },
}
