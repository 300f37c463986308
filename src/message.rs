//! Protocol request and response value types.

use serde::{Deserialize, Serialize};

use crate::entry::LogEntry;

/// AppendEntries RPC - invoked by the leader to replicate log entries; an
/// empty entry list doubles as the heartbeat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    /// Leader's term.
    pub term: u64,
    /// So followers can redirect clients.
    pub leader_name: String,
    /// Index of the log entry immediately preceding the new ones.
    pub prev_log_index: u64,
    /// Term of the entry at `prev_log_index`.
    pub prev_log_term: u64,
    /// Entries to store (empty for heartbeat).
    pub entries: Vec<LogEntry>,
    /// Leader's commit index.
    pub commit_index: u64,
}

/// AppendEntries RPC response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    /// Current term, for the leader to update itself.
    pub term: u64,
    /// True if the follower contained an entry matching `prev_log_index`
    /// and `prev_log_term`.
    pub success: bool,
    /// The responder's commit index.
    pub index: u64,
}

/// RequestVote RPC - invoked by candidates to gather votes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    /// Candidate's term.
    pub term: u64,
    /// Candidate requesting the vote.
    pub candidate_name: String,
    /// Index of the candidate's last log entry.
    pub last_log_index: u64,
    /// Term of the candidate's last log entry.
    pub last_log_term: u64,
}

/// RequestVote RPC response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    /// Current term, for the candidate to update itself.
    pub term: u64,
    /// True if the candidate received the vote.
    pub vote_granted: bool,
}

/// Snapshot transfer RPC - sent to a follower that has fallen behind the
/// leader's compacted log prefix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRequest {
    /// Leader sending the snapshot.
    pub leader_name: String,
    /// Last log index covered by the snapshot.
    pub last_index: u64,
    /// Term of the entry at `last_index`.
    pub last_term: u64,
    /// Cluster membership at snapshot time.
    pub peers: Vec<String>,
    /// Opaque state machine image.
    pub state: Vec<u8>,
}

/// Snapshot transfer RPC response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotResponse {
    /// Term the follower installed.
    pub term: u64,
    /// True if the snapshot was installed.
    pub success: bool,
    /// The follower's commit index after installation.
    pub commit_index: u64,
}

impl AppendEntriesRequest {
    pub fn new(
        term: u64,
        leader_name: impl Into<String>,
        prev_log_index: u64,
        prev_log_term: u64,
        entries: Vec<LogEntry>,
        commit_index: u64,
    ) -> Self {
        AppendEntriesRequest {
            term,
            leader_name: leader_name.into(),
            prev_log_index,
            prev_log_term,
            entries,
            commit_index,
        }
    }

    /// Creates a heartbeat (empty AppendEntries) request.
    pub fn heartbeat(
        term: u64,
        leader_name: impl Into<String>,
        prev_log_index: u64,
        prev_log_term: u64,
        commit_index: u64,
    ) -> Self {
        AppendEntriesRequest::new(
            term,
            leader_name,
            prev_log_index,
            prev_log_term,
            vec![],
            commit_index,
        )
    }

    /// Returns true if this request carries no entries.
    pub fn is_heartbeat(&self) -> bool {
        self.entries.is_empty()
    }
}

impl AppendEntriesResponse {
    pub fn new(term: u64, success: bool, index: u64) -> Self {
        AppendEntriesResponse {
            term,
            success,
            index,
        }
    }

    /// Creates a successful response.
    pub fn success(term: u64, index: u64) -> Self {
        AppendEntriesResponse::new(term, true, index)
    }

    /// Creates a failure response.
    pub fn failure(term: u64, index: u64) -> Self {
        AppendEntriesResponse::new(term, false, index)
    }
}

impl RequestVoteRequest {
    pub fn new(
        term: u64,
        candidate_name: impl Into<String>,
        last_log_index: u64,
        last_log_term: u64,
    ) -> Self {
        RequestVoteRequest {
            term,
            candidate_name: candidate_name.into(),
            last_log_index,
            last_log_term,
        }
    }
}

impl RequestVoteResponse {
    /// Creates a response granting the vote.
    pub fn grant(term: u64) -> Self {
        RequestVoteResponse {
            term,
            vote_granted: true,
        }
    }

    /// Creates a response denying the vote.
    pub fn deny(term: u64) -> Self {
        RequestVoteResponse {
            term,
            vote_granted: false,
        }
    }
}

impl SnapshotResponse {
    pub fn new(term: u64, success: bool, commit_index: u64) -> Self {
        SnapshotResponse {
            term,
            success,
            commit_index,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_entries_request() {
        let entries = vec![
            LogEntry::new(1, 1, "set".to_string(), b"a".to_vec()),
            LogEntry::new(2, 1, "set".to_string(), b"b".to_vec()),
        ];

        let request = AppendEntriesRequest::new(1, "n1", 0, 0, entries, 0);
        assert_eq!(request.term, 1);
        assert_eq!(request.leader_name, "n1");
        assert_eq!(request.entries.len(), 2);
        assert!(!request.is_heartbeat());

        let heartbeat = AppendEntriesRequest::heartbeat(2, "n1", 5, 1, 3);
        assert!(heartbeat.is_heartbeat());
        assert_eq!(heartbeat.prev_log_index, 5);
        assert_eq!(heartbeat.commit_index, 3);
    }

    #[test]
    fn test_append_entries_response() {
        let ok = AppendEntriesResponse::success(5, 10);
        assert!(ok.success);
        assert_eq!(ok.index, 10);

        let failed = AppendEntriesResponse::failure(6, 8);
        assert!(!failed.success);
        assert_eq!(failed.term, 6);
    }

    #[test]
    fn test_request_vote_round() {
        let request = RequestVoteRequest::new(5, "n2", 10, 4);
        assert_eq!(request.candidate_name, "n2");
        assert_eq!(request.last_log_index, 10);

        let granted = RequestVoteResponse::grant(5);
        assert!(granted.vote_granted);

        let denied = RequestVoteResponse::deny(6);
        assert!(!denied.vote_granted);
        assert_eq!(denied.term, 6);
    }
}
