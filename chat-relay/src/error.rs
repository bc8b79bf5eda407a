//! Error taxonomy shared by the relay components.
//!
//! Every failure is scoped to one connection except [`StorageError`], which
//! is only ever logged, and bind failures, which surface from `main`.

use std::io;

use crate::message::{MAX_BODY_CHARS, MIN_BODY_CHARS, MIN_USERNAME_CHARS};

/// A username or body that violates the message constraints.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("username must be at least {MIN_USERNAME_CHARS} characters (got {0})")]
    UsernameTooShort(usize),

    #[error("message must be at least {MIN_BODY_CHARS} characters (got {0})")]
    BodyTooShort(usize),

    #[error("message too long (max {MAX_BODY_CHARS} characters, got {0})")]
    BodyTooLong(usize),
}

/// Failure to turn a frame payload into a typed value.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// Invalid JSON, unknown frame type, or a required field is missing.
    #[error("malformed frame: {0}")]
    MalformedFrame(#[source] serde_json::Error),

    /// The payload is not valid UTF-8.
    #[error("frame is not valid UTF-8: {0}")]
    Encoding(#[from] std::str::Utf8Error),

    #[error(transparent)]
    Validation(#[from] ValidationError),
}

impl DecodeError {
    /// Whether this error counts toward the malformed-frame budget of a
    /// session. Validation failures are reported to the sender instead.
    pub fn is_malformed(&self) -> bool {
        matches!(self, Self::MalformedFrame(_) | Self::Encoding(_))
    }
}

/// Transport-level framing failure.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame of {size} bytes exceeds maximum {max}")]
    TooLarge { size: usize, max: usize },

    /// The peer closed the stream on a frame boundary.
    #[error("connection closed")]
    ConnectionClosed,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Failure to hand a frame to a connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("connection is closed")]
    Closed,

    /// The outbound queue is full; the peer is not keeping up.
    #[error("outbound queue full ({capacity} frames)")]
    Backpressure { capacity: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("username '{0}' is already in use")]
    DuplicateUsername(String),
}

/// Reasons a session leaves the `Active` state other than a clean quit.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("connection closed before handshake")]
    ClosedBeforeHandshake,

    #[error("no join frame within {0:?}")]
    HandshakeTimeout(std::time::Duration),

    #[error("expected a join frame first")]
    UnexpectedFrame,

    #[error("{count} malformed frames exceeded the limit of {threshold}")]
    ProtocolAbuse { count: u32, threshold: u32 },

    #[error("relay is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// Failure reported by a history sink. Never fatal to routing.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("history I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("history encoding error: {0}")]
    Encode(#[from] serde_json::Error),
}
