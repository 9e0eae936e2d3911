//! One-time registration handshake.
//!
//! The first frame a process sends on a new connection announces its
//! identity and protocol version to the peer. The payload is a JSON-encoded
//! [`Registration`]; the frame's type tag is chosen by the application layer
//! like any other message type.

use serde::{Deserialize, Serialize};

use crate::error::{ConnectionError, ConnectionResult, PROTOCOL_VERSION};

/// Identity and metadata announced by [`crate::Connection::register`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Registration {
    /// Protocol version spoken by the sender.
    pub protocol_version: u32,

    /// Sender identifier for logging and diagnostics,
    /// e.g. `"gridflow-worker/0.1.0"`.
    pub peer_info: String,

    /// OS process id of the sender.
    pub pid: u32,
}

impl Registration {
    /// Create a registration for the current process.
    #[must_use]
    pub fn new(peer_info: impl Into<String>) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            peer_info: peer_info.into(),
            pid: std::process::id(),
        }
    }

    /// Serialize to the JSON wire payload.
    pub fn to_bytes(&self) -> ConnectionResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| ConnectionError::Serialization {
            reason: e.to_string(),
        })
    }

    /// Parse a registration payload received from a peer.
    pub fn from_bytes(bytes: &[u8]) -> ConnectionResult<Self> {
        serde_json::from_slice(bytes).map_err(|e| ConnectionError::Serialization {
            reason: e.to_string(),
        })
    }
}
