// Keelwire error types and the callback-facing error taxonomy.

use keeltrust::KeelTrustError;
use thiserror::Error;

/// Top-level error type for the Keelwire crate.
#[derive(Debug, Error)]
pub enum KeelWireError {
    // ── Framing errors ──────────────────────────────────────────────────
    #[error("frame too short: expected at least {expected} bytes, got {actual}")]
    FrameTooShort { expected: usize, actual: usize },

    #[error("declared length {declared} does not match remaining {remaining} bytes")]
    LengthMismatch { declared: usize, remaining: usize },

    #[error("unknown packet type: {0:#04x}")]
    UnknownPacketType(u8),

    #[error("serialization failed")]
    SerializationFailed,

    // ── Connection errors ───────────────────────────────────────────────
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("connection timed out")]
    ConnectionTimeout,

    #[error("no heartbeat reply within the liveness window")]
    HeartbeatWaitFailed,

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("send hook refused the buffer")]
    SendFailed,

    #[error("not connected")]
    NotConnected,

    #[error("connection is not authenticated yet")]
    NotAuthenticated,

    // ── Server bookkeeping ──────────────────────────────────────────────
    #[error("no such client: {0}")]
    ClientNotFound(String),

    #[error("client already registered: {0}")]
    ClientAlreadyExists(String),

    // ── Trust bootstrap ─────────────────────────────────────────────────
    #[error("cookie error: {0}")]
    Cookie(String),

    #[error("cookie I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Trust(#[from] KeelTrustError),
}

/// Crate-level result alias.
pub type Result<T> = std::result::Result<T, KeelWireError>;

// ── Callback taxonomy ────────────────────────────────────────────────────

/// Coarse error classes surfaced to application error callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    HandshakeFailed,
    ConnectionTimeout,
    HeartbeatWaitFailed,
    ProtocolViolation,
    SerializationFailed,
}

impl ErrorKind {
    pub fn label(&self) -> &'static str {
        match self {
            ErrorKind::HandshakeFailed => "handshake-failed",
            ErrorKind::ConnectionTimeout => "connection-timeout",
            ErrorKind::HeartbeatWaitFailed => "heartbeat-wait-failed",
            ErrorKind::ProtocolViolation => "protocol-violation",
            ErrorKind::SerializationFailed => "serialization-failed",
        }
    }
}

impl KeelWireError {
    /// Map to the class reported through error callbacks.
    pub fn kind(&self) -> ErrorKind {
        match self {
            KeelWireError::FrameTooShort { .. }
            | KeelWireError::LengthMismatch { .. }
            | KeelWireError::UnknownPacketType(_)
            | KeelWireError::SerializationFailed => ErrorKind::SerializationFailed,

            KeelWireError::ConnectionTimeout => ErrorKind::ConnectionTimeout,
            KeelWireError::HeartbeatWaitFailed => ErrorKind::HeartbeatWaitFailed,

            // A frame that fails to open is indistinguishable from a peer
            // breaking the protocol.
            KeelWireError::Trust(KeelTrustError::Decryption(_)) => ErrorKind::ProtocolViolation,

            KeelWireError::ProtocolViolation(_)
            | KeelWireError::NotAuthenticated
            | KeelWireError::SendFailed
            | KeelWireError::NotConnected
            | KeelWireError::ClientNotFound(_)
            | KeelWireError::ClientAlreadyExists(_) => ErrorKind::ProtocolViolation,

            KeelWireError::HandshakeFailed(_)
            | KeelWireError::Cookie(_)
            | KeelWireError::Io(_)
            | KeelWireError::Trust(_) => ErrorKind::HandshakeFailed,
        }
    }
}
