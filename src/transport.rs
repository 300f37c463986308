//! Transport abstraction for inter-server RPCs.

use async_trait::async_trait;

use crate::message::{
    AppendEntriesRequest, AppendEntriesResponse, RequestVoteRequest, RequestVoteResponse,
    SnapshotRequest, SnapshotResponse,
};
use crate::Result;

/// Ships requests to remote servers and returns their responses.
///
/// Implementations may be backed by any wire protocol; the engine only ever
/// calls them from peer tasks, off the event loop, and treats every call as
/// blocking until the remote responds. A failed delivery is absorbed at the
/// peer: the tick is skipped and the next heartbeat retries.
#[async_trait]
pub trait Transporter: Send + Sync + 'static {
    /// Sends an AppendEntries RPC to the named peer.
    async fn send_append_entries(
        &self,
        peer: &str,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse>;

    /// Sends a RequestVote RPC to the named peer.
    async fn send_request_vote(
        &self,
        peer: &str,
        req: RequestVoteRequest,
    ) -> Result<RequestVoteResponse>;

    /// Sends a snapshot to a peer that has fallen behind the compacted log.
    async fn send_snapshot(&self, peer: &str, req: SnapshotRequest) -> Result<SnapshotResponse>;
}
