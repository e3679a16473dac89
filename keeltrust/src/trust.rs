// Peer trust store and the one-shot key-approval decision slot.
//
// The store always carries the endpoint's own keypair under a reserved
// entry that no bulk operation can evict. Named peer keys gate the
// handshake's identity check; an unknown key surfaces to the application
// as a PendingDecision that exactly one call resolves.

use std::collections::HashMap;

use parking_lot::{Condvar, Mutex};
use secp256k1::PublicKey;
use sha2::{Digest, Sha256};

use crate::crypto::keys::{validate_identity_key, IdentityKeyPair};
use crate::error::{KeelTrustError, Result};

/// Reserved name of the store's own key entry.
pub const OWN_KEY_NAME: &str = "own";

// ── Peer ─────────────────────────────────────────────────────────────────

/// A named trusted peer key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Peer {
    pub name: String,
    pub key: PublicKey,
}

impl Peer {
    /// Build a peer from raw SEC1 key bytes, validating them.
    pub fn new(name: impl Into<String>, key_bytes: &[u8]) -> Result<Self> {
        Ok(Self {
            name: name.into(),
            key: validate_identity_key(key_bytes)?,
        })
    }

    pub fn from_public_key(name: impl Into<String>, key: PublicKey) -> Self {
        Self {
            name: name.into(),
            key,
        }
    }

    /// Hex fingerprint of the compressed key.
    pub fn key_hex(&self) -> String {
        hex::encode(self.key.serialize())
    }
}

// ── Trust store ──────────────────────────────────────────────────────────

/// Named peer keys plus the endpoint's own identity keypair.
pub struct TrustStore {
    own: IdentityKeyPair,
    peers: HashMap<String, PublicKey>,
}

impl TrustStore {
    pub fn new(own: IdentityKeyPair) -> Self {
        Self {
            own,
            peers: HashMap::new(),
        }
    }

    /// Store backed by a fresh throwaway identity.
    pub fn with_ephemeral_key() -> Self {
        Self::new(IdentityKeyPair::generate())
    }

    /// Add a peer. Re-adding a name evicts the key stored under it.
    pub fn add_peer(&mut self, peer: Peer) -> Result<()> {
        if peer.name == OWN_KEY_NAME {
            return Err(KeelTrustError::ReservedName(peer.name));
        }
        self.peers.insert(peer.name, peer.key);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&PublicKey> {
        self.peers.get(name)
    }

    pub fn remove(&mut self, name: &str) -> bool {
        self.peers.remove(name).is_some()
    }

    /// Whether any named entry holds this exact key.
    pub fn has_peer_key(&self, key: &PublicKey) -> bool {
        self.peers.values().any(|k| k == key)
    }

    /// Find a peer whose compressed key hashes (SHA-256) to `digest`.
    pub fn find_by_key_hash(&self, digest: &[u8; 32]) -> Option<(&str, &PublicKey)> {
        self.peers.iter().find_map(|(name, key)| {
            let hash: [u8; 32] = Sha256::digest(key.serialize()).into();
            (hash == *digest).then_some((name.as_str(), key))
        })
    }

    /// Drop every named peer and reseed from `peers`. The own entry is
    /// untouched.
    pub fn replace_all_but_own(&mut self, peers: impl IntoIterator<Item = Peer>) -> Result<()> {
        self.peers.clear();
        for peer in peers {
            self.add_peer(peer)?;
        }
        Ok(())
    }

    pub fn own_keypair(&self) -> &IdentityKeyPair {
        &self.own
    }

    pub fn own_public_key(&self) -> PublicKey {
        self.own.public_key()
    }

    pub fn own_key_hex(&self) -> String {
        self.own.public_key_hex()
    }

    pub fn peer_names(&self) -> Vec<&str> {
        self.peers.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

// ── Pending decision ─────────────────────────────────────────────────────

/// One-shot accept/reject slot for an unknown peer key.
///
/// The I/O thread parks in `wait` while the application decides; the first
/// `resolve` wins and later calls are ignored. Shutdown paths force-reject
/// so no waiter is left parked forever.
pub struct PendingDecision {
    state: Mutex<Option<bool>>,
    cond: Condvar,
}

impl PendingDecision {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(None),
            cond: Condvar::new(),
        }
    }

    /// Resolve the decision. Returns false when it was already resolved.
    pub fn resolve(&self, accept: bool) -> bool {
        let mut state = self.state.lock();
        if state.is_some() {
            return false;
        }
        *state = Some(accept);
        self.cond.notify_all();
        true
    }

    /// Block until resolved.
    pub fn wait(&self) -> bool {
        let mut state = self.state.lock();
        loop {
            if let Some(accept) = *state {
                return accept;
            }
            self.cond.wait(&mut state);
        }
    }

    /// Non-blocking peek.
    pub fn try_get(&self) -> Option<bool> {
        *self.state.lock()
    }

    /// Reject unless already resolved. Used on teardown.
    pub fn force_reject(&self) {
        self.resolve(false);
    }
}

impl Default for PendingDecision {
    fn default() -> Self {
        Self::new()
    }
}
