//! Error types for the consensus engine.

use std::io;

/// Result type alias for convenience.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for server, log and snapshot operations.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A command was submitted to a server that is not the leader.
    #[error("not current leader")]
    NotLeader,

    /// A peer with the same name is already registered.
    #[error("duplicate peer: {0}")]
    DuplicatePeer(String),

    /// The named peer is not registered.
    #[error("peer not found: {0}")]
    PeerNotFound(String),

    /// The commit deadline expired before a quorum acknowledged the entry.
    /// The entry may still commit later; callers must treat this as
    /// "outcome unknown", not "rejected".
    #[error("command timeout")]
    CommandTimeout,

    /// The server event loop is not running.
    #[error("server not running")]
    NotRunning,

    /// The server is already running.
    #[error("server already running")]
    AlreadyRunning,

    /// Invalid server or cluster configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Entry index is not contiguous with the log.
    #[error("entry index {index} out of order (expected {expected})")]
    IndexOutOfOrder {
        /// Index carried by the rejected entry.
        index: u64,
        /// Index the log would have assigned.
        expected: u64,
    },

    /// Entry term is older than the last entry's term.
    #[error("entry term {term} is older than last term {last}")]
    StaleTerm {
        /// Term carried by the rejected entry.
        term: u64,
        /// Term of the last entry in the log.
        last: u64,
    },

    /// Attempted to rewrite history at or below the commit index.
    #[error("index {0} is already committed")]
    CommittedIndex(u64),

    /// The log has no entry at the requested index.
    #[error("entry missing at index {0}")]
    EntryMissing(u64),

    /// The entry at the index does not carry the expected term.
    #[error("entry at index {index} has term {actual}, expected {expected}")]
    EntryMismatch {
        /// Index that failed the log-matching check.
        index: u64,
        /// Term the leader claimed for that index.
        expected: u64,
        /// Term actually stored at that index.
        actual: u64,
    },

    /// Checksum validation failed.
    #[error("checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        /// Expected checksum value.
        expected: u32,
        /// Actual checksum value.
        actual: u32,
    },

    /// A log record could not be decoded.
    #[error("bad record: {0}")]
    BadRecord(String),

    /// A snapshot file could not be read back.
    #[error("bad snapshot: {0}")]
    BadSnapshot(String),

    /// A snapshot is already being taken.
    #[error("snapshot already in progress")]
    SnapshotInProgress,

    /// The log has no committed entries to snapshot.
    #[error("no committed entries")]
    NoCommittedEntries,

    /// A command failed while being applied to the state machine.
    #[error("command failed: {0}")]
    Command(String),

    /// The transport failed to deliver a request.
    #[error("transport error: {0}")]
    Transport(String),

    /// Snapshot payload serialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::EntryMismatch {
            index: 7,
            expected: 3,
            actual: 2,
        };
        assert_eq!(err.to_string(), "entry at index 7 has term 2, expected 3");

        let err = Error::ChecksumMismatch {
            expected: 0x12345678,
            actual: 0x87654321,
        };
        assert_eq!(
            err.to_string(),
            "checksum mismatch: expected 12345678, got 87654321"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        match err {
            Error::Io(_) => {}
            _ => panic!("Expected Io error variant"),
        }
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Error>();
    }
}
