//! Error types and protocol constants for the connection layer.
//!
//! All fallible operations in this crate return [`ConnectionResult`]. The
//! variants are structured so that callers can branch on the failure mode:
//! transient connect failures are retryable, transport I/O failures make the
//! connection sticky-broken, and a cookie mismatch from an addressable peer
//! is a fatal protocol violation.

use std::io;

use thiserror::Error;

/// Maximum frame payload size in bytes (16 MiB).
///
/// The length field of an incoming header is validated against this bound
/// BEFORE the body buffer is allocated, so a corrupt or hostile peer cannot
/// trigger memory exhaustion with a single header.
pub const MAX_FRAME_SIZE: u64 = 16 * 1024 * 1024;

/// Default protocol cookie.
///
/// Both ends of a connection must be configured with the same cookie; every
/// frame header carries it and it is validated on receipt. Deployments (and
/// tests) may override it through [`crate::ConnectionConfig`].
pub const DEFAULT_COOKIE: i64 = i64::from_le_bytes(*b"gridflw\x01");

/// Protocol version announced in the registration handshake.
pub const PROTOCOL_VERSION: u32 = 1;

/// Errors for connection establishment, framing, and message I/O.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Underlying transport I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The connection is broken or has been closed.
    ///
    /// Once a connection enters this state it is sticky: all pending and
    /// future writes fail with this error without touching the transport.
    #[error("connection closed")]
    ConnectionClosed,

    /// A frame header carried the wrong protocol cookie.
    ///
    /// When `remote` is non-empty the peer is addressable and the mismatch
    /// is fatal (see [`ConnectionError::is_fatal`]); otherwise the frame is
    /// dropped with a warning and the connection keeps processing.
    #[error("protocol cookie mismatch: expected {expected:#x}, received {received:#x} (remote: {remote:?})")]
    CookieMismatch {
        /// Cookie this connection was configured with.
        expected: i64,
        /// Cookie found in the received header.
        received: i64,
        /// Remote endpoint description, empty if unaddressable.
        remote: String,
    },

    /// A synchronous read expected one message type but received another.
    #[error("message type mismatch: expected {expected}, received {received}")]
    TypeMismatch {
        /// Type tag the caller asked for.
        expected: i64,
        /// Type tag found in the received header.
        received: i64,
    },

    /// A frame header announced a payload larger than [`MAX_FRAME_SIZE`].
    #[error("frame too large: {size} bytes exceeds maximum {max} bytes")]
    FrameTooLarge {
        /// Payload length from the header.
        size: u64,
        /// Maximum allowed payload length.
        max: u64,
    },

    /// The endpoint string could not be parsed as a socket path or address.
    #[error("invalid endpoint: {endpoint:?}")]
    InvalidEndpoint {
        /// The offending endpoint string.
        endpoint: String,
    },

    /// Connect retries were exhausted without a successful connection.
    #[error("connect failed after {attempts} attempt(s): {source}")]
    ConnectFailed {
        /// Number of connection attempts made.
        attempts: u32,
        /// The last transport error observed.
        source: io::Error,
    },

    /// The connect timeout budget elapsed before a connection succeeded.
    #[error("connect timed out after {elapsed_ms} ms")]
    Timeout {
        /// Milliseconds elapsed when the budget was exceeded.
        elapsed_ms: u64,
    },

    /// `register` was invoked more than once on the same connection.
    #[error("connection is already registered")]
    AlreadyRegistered,

    /// A handshake payload could not be serialized or deserialized.
    #[error("serialization error: {reason}")]
    Serialization {
        /// Description of the failure.
        reason: String,
    },
}

impl ConnectionError {
    /// Create a cookie mismatch error.
    #[must_use]
    pub fn cookie_mismatch(expected: i64, received: i64, remote: impl Into<String>) -> Self {
        Self::CookieMismatch {
            expected,
            received,
            remote: remote.into(),
        }
    }

    /// Create a frame too large error.
    #[must_use]
    pub const fn frame_too_large(size: u64) -> Self {
        Self::FrameTooLarge {
            size,
            max: MAX_FRAME_SIZE,
        }
    }

    /// Returns `true` if the hosting process should treat this error as
    /// unrecoverable and terminate.
    ///
    /// A cookie mismatch from an addressable remote means a foreign or
    /// corrupted peer is speaking on a channel assumed to be privately
    /// coordinated; continuing would process untrusted frames.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::CookieMismatch { remote, .. } if !remote.is_empty())
    }

    /// Returns `true` if retrying the operation may succeed.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::ConnectFailed { .. })
    }

    /// Returns `true` if this error indicates the peer violated the wire
    /// protocol (as opposed to a transport-level failure).
    #[must_use]
    pub const fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Self::CookieMismatch { .. } | Self::TypeMismatch { .. } | Self::FrameTooLarge { .. }
        )
    }
}

/// Result type for connection operations.
pub type ConnectionResult<T> = Result<T, ConnectionError>;
