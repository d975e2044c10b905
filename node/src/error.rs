use thiserror::Error;

use chordkv_lib::NodeId;

/// Failures a node surfaces to its callers.
///
/// Transient peer failures during periodic maintenance are logged and absorbed;
/// only client-facing operations return these.
#[derive(Debug, Error)]
pub enum ChordError {
    /// RPC timed out or the connection could not be established.
    #[error("peer {address} unreachable: {reason}")]
    PeerUnreachable { address: String, reason: String },

    /// The bootstrap node given to `join` could not be reached.
    #[error("bootstrap node {address} unreachable: {reason}")]
    BootstrapUnreachable { address: String, reason: String },

    /// Every routing fallback for `id` was exhausted.
    #[error("lookup for id {id} failed: no reachable route")]
    LookupFailed { id: NodeId },

    /// Best-effort departure did not finish handing off its keys.
    #[error("handoff to {address} incomplete: {reason}")]
    HandoffIncomplete { address: String, reason: String },

    #[error("unexpected response from {address}: {response}")]
    UnexpectedResponse { address: String, response: String },

    #[error("node has not joined a ring")]
    NotJoined,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ChordError {
    pub(crate) fn unreachable(
        address: &str,
        reason: impl std::fmt::Display,
    ) -> Self {
        ChordError::PeerUnreachable {
            address: address.to_string(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn unexpected(address: &str, response: impl std::fmt::Debug) -> Self {
        ChordError::UnexpectedResponse {
            address: address.to_string(),
            response: format!("{:?}", response),
        }
    }

    /// True for failures that mean the peer could not be talked to at all.
    pub fn is_unreachable(&self) -> bool {
        matches!(
            self,
            ChordError::PeerUnreachable { .. } | ChordError::BootstrapUnreachable { .. }
        )
    }
}
