//! Crate-wide error type.

use std::io;

use thiserror::Error;

use crate::base::Seqno;
use crate::iface::GcsError;

/// Unified error type for all state transfer operations. Variants are
/// grouped by how the coordinator reacts to them: retryable submit errors,
/// transient stream errors, protocol violations, and cancellation.
#[derive(Debug, Error)]
pub enum SyncrepError {
    /// Group communication refused the request; retryable kinds are retried
    /// with fixed backoff by the submit loop.
    #[error("group communication error: {0}")]
    Gcs(#[from] GcsError),

    /// Could not open the IST connection to the peer.
    #[error("connect to '{0}' failed: {1}")]
    Connect(String, io::Error),

    /// Mid-transfer socket failure.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// Peer speaks an incompatible IST protocol version.
    #[error("protocol version mismatch: local {local}, peer {peer}")]
    ProtocolVersion { local: u32, peer: u32 },

    /// The writeset cache no longer retains a seqno needed for the stream.
    #[error("seqno {0} out of cache retention range")]
    OutOfRange(Seqno),

    /// A seqno was not found in the writeset cache.
    #[error("seqno {0} not found in cache")]
    NotFound(Seqno),

    /// Delivered seqno does not continue the contiguous stream.
    #[error("seqno gap in stream: expected {expected}, got {got}")]
    Sequence { expected: Seqno, got: Seqno },

    /// Structurally malformed message.
    #[error("invalid message: {0}")]
    Invalid(String),

    /// A payload length exceeds what the framing can carry.
    #[error("message length {0} unrepresentable")]
    MessageTooLong(usize),

    /// The submit retry window outlasted the local monitor's capacity.
    #[error("local monitor capacity exhausted while requesting state transfer")]
    Deadlock,

    /// Transfer task torn down by a shutdown-time cancel.
    #[error("cancelled")]
    Cancelled,

    /// Receiver torn down by `interrupt()`.
    #[error("interrupted")]
    Interrupted,

    /// Configuration parsing or validation failure.
    #[error("config error: {0}")]
    Config(String),

    /// Wire encoding failure.
    #[error("encode error: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    /// Wire decoding failure.
    #[error("decode error: {0}")]
    Decode(#[from] bincode::error::DecodeError),

    /// Free-form error produced by `logged_err!`.
    #[error("{0}")]
    Msg(String),
}

impl SyncrepError {
    /// Construct a free-form error message variant.
    pub fn msg(m: impl ToString) -> Self {
        SyncrepError::Msg(m.to_string())
    }

    /// errno-style code reported through `EventObserver::ist_end()`.
    /// Zero is reserved for success.
    pub fn code(&self) -> i32 {
        match self {
            SyncrepError::Interrupted => 4,               // EINTR
            SyncrepError::Io(_) | SyncrepError::Connect(..) => 5, // EIO
            SyncrepError::Gcs(e) => e.errno(),
            SyncrepError::NotFound(_) => 2,               // ENOENT
            SyncrepError::Invalid(_) | SyncrepError::Config(_) => 22, // EINVAL
            SyncrepError::Sequence { .. }
            | SyncrepError::ProtocolVersion { .. }
            | SyncrepError::Encode(_)
            | SyncrepError::Decode(_) => 71,              // EPROTO
            SyncrepError::OutOfRange(_) => 34,            // ERANGE
            SyncrepError::Deadlock => 35,                 // EDEADLK
            SyncrepError::MessageTooLong(_) => 90,        // EMSGSIZE
            SyncrepError::Cancelled => 125,               // ECANCELED
            SyncrepError::Msg(_) => 5,                    // EIO
        }
    }
}

impl From<toml::de::Error> for SyncrepError {
    fn from(e: toml::de::Error) -> Self {
        SyncrepError::Config(e.to_string())
    }
}
