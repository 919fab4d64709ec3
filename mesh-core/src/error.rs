//! Error taxonomy shared by the core and the node runtime.

use serde::{Deserialize, Serialize};

/// Errors surfaced to callers of the catalog and coordinator.
#[derive(Debug, thiserror::Error)]
pub enum MeshError {
    /// Peer unreachable, connect timeout, stalled or closed channel.
    #[error("connection error: {0}")]
    Connection(String),
    /// Metadata mismatch, bad chunk, integrity failure, undecodable frame.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// Payload, index or preferences I/O failed.
    #[error("storage error: {context}: {source}")]
    Storage {
        context: String,
        #[source]
        source: std::io::Error,
    },
    /// A session could not persist what it received. The underlying I/O error was
    /// reported when the session failed; only its message survives.
    #[error("storage error: {0}")]
    Persist(String),
    /// Duplicate session for a (peer, artifact) pair or duplicate artifact id.
    #[error("conflict: {0}")]
    Conflict(String),
    /// Unknown peer, artifact or session.
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// The external generation service failed or returned an unusable response.
    #[error("generation failed: {0}")]
    Generation(String),
}

impl MeshError {
    pub fn storage(context: impl Into<String>, source: std::io::Error) -> Self {
        MeshError::Storage {
            context: context.into(),
            source,
        }
    }

    pub fn already_in_progress() -> Self {
        MeshError::Conflict("transfer already in progress".into())
    }
}

/// Why a transfer session ended in `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum FailureReason {
    #[error("timed out connecting to peer")]
    Timeout,
    #[error("peer unreachable: {0}")]
    Unreachable(String),
    #[error("metadata mismatch: {0}")]
    Mismatch(String),
    #[error("integrity check failed: {0}")]
    Integrity(String),
    #[error("transfer stalled")]
    Stalled,
    #[error("peer lost")]
    PeerLost,
    #[error("rejected by peer: {0}")]
    Rejected(String),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("storage failure: {0}")]
    Storage(String),
    #[error("conflict: {0}")]
    Conflict(String),
}

impl FailureReason {
    /// Map a terminal session cause onto the caller-facing taxonomy.
    pub fn to_error(&self) -> MeshError {
        let msg = self.to_string();
        match self {
            FailureReason::Timeout
            | FailureReason::Unreachable(_)
            | FailureReason::Stalled
            | FailureReason::PeerLost => MeshError::Connection(msg),
            FailureReason::Mismatch(_)
            | FailureReason::Integrity(_)
            | FailureReason::Rejected(_)
            | FailureReason::Protocol(_) => MeshError::Protocol(msg),
            FailureReason::Storage(_) => MeshError::Persist(msg),
            FailureReason::Conflict(_) => MeshError::Conflict(msg),
        }
    }
}
