// KeelTrust error types

use thiserror::Error;

/// Top-level error type for the KeelTrust crate.
#[derive(Debug, Error)]
pub enum KeelTrustError {
    // ── Key errors ──────────────────────────────────────────────────────
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("signature verification failed")]
    SignatureVerification,

    #[error("key encoding error: {0}")]
    KeyEncoding(#[from] serde_json::Error),

    // ── Cipher errors ───────────────────────────────────────────────────
    #[error("AEAD encryption failed: {0}")]
    Encryption(String),

    #[error("AEAD decryption failed: {0}")]
    Decryption(String),

    #[error("nonce counter exhausted, session must be rekeyed")]
    NonceExhausted,

    #[error("unsupported cipher suite: {0:#04x}")]
    UnknownCipherSuite(u8),

    // ── Handshake errors ────────────────────────────────────────────────
    #[error("handshake error: {0}")]
    Handshake(String),

    #[error("invalid handshake state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    // ── Trust store errors ──────────────────────────────────────────────
    #[error("peer name {0:?} is reserved")]
    ReservedName(String),

    // ── I/O ─────────────────────────────────────────────────────────────
    #[error("key file I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Crate-level result alias.
pub type Result<T> = std::result::Result<T, KeelTrustError>;
