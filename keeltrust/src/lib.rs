// KeelTrust -- Identity Keys, Peer Trust & Authenticated Session Encryption
//
// Crate root: module declarations and public re-exports.

pub mod crypto;
pub mod error;
pub mod session;
pub mod trust;

// Re-export key types at crate root for convenience.
pub use crypto::keys::{validate_identity_key, IdentityKeyPair};
pub use secp256k1::PublicKey;
pub use error::{KeelTrustError, Result};
pub use session::{
    AeadSession, HandshakeStep, InnerState, OuterState, SessionRole, StepKind,
};
pub use trust::{Peer, PendingDecision, TrustStore, OWN_KEY_NAME};
