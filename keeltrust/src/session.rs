// AEAD session engine: the per-connection handshake and encryption state
// machine.
//
//   Initiator                           Acceptor
//     |--- EncInit (eph pub, suite) ------->|
//     |<-- EncAck (eph pub) ----------------|
//     |<-- EncInit (eph pub, suite) --------|   reverse direction
//     |--- EncAck (eph pub) --------------->|   both directions keyed
//     |=== AuthChallenge/Reply/Propose  ====|   sealed identity rounds
//     |=== Rekey notices, both ways =========|   mandatory post-auth ratchet
//     |=========== application data =========|
//
// The engine is transport-agnostic: it consumes peer step payloads and
// returns the steps to send back. Framing, sealing of outbound steps, and
// socket I/O belong to the wire layer.

use bytes::Bytes;
use secp256k1::PublicKey;
use sha2::{Digest, Sha256};

use crate::crypto::aead::{
    derive_direction_key, DirectionKey, CIPHER_SUITE_CHACHA20POLY1305,
};
use crate::crypto::ecdh::EphemeralKeyPair;
use crate::crypto::keys::{
    validate_identity_key, verify_digest, IdentityKeyPair, COMPRESSED_KEY_LEN, SIGNATURE_LEN,
};
use crate::error::{KeelTrustError, Result};
use crate::trust::TrustStore;

/// EncInit payload: compressed ephemeral key plus one cipher-suite byte.
pub const ENC_INIT_LEN: usize = COMPRESSED_KEY_LEN + 1;
/// EncAck payload: compressed ephemeral key.
pub const ENC_ACK_LEN: usize = COMPRESSED_KEY_LEN;
/// Auth challenge and propose payloads: a SHA-256 digest.
pub const CHALLENGE_LEN: usize = 32;
/// Rekey notice payload: all zeroes, key-sized so it blends with EncAck.
pub const REKEY_NOTICE_LEN: usize = 33;

/// The anonymous challenge sent when client identity is not requested.
const ANON_CHALLENGE: [u8; CHALLENGE_LEN] = [0u8; CHALLENGE_LEN];

/// Payload of a rekey notice.
pub const REKEY_NOTICE: [u8; REKEY_NOTICE_LEN] = [0u8; REKEY_NOTICE_LEN];

// ── Step kinds and states ────────────────────────────────────────────────

/// Handshake step discriminants, one per handshake packet type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepKind {
    Start,
    PresentPubKey,
    PresentPubKeyChild,
    EncInit,
    EncAck,
    Rekey,
    AuthChallenge,
    AuthReply,
    AuthPropose,
}

impl StepKind {
    pub fn label(&self) -> &'static str {
        match self {
            StepKind::Start => "start",
            StepKind::PresentPubKey => "present-pubkey",
            StepKind::PresentPubKeyChild => "present-pubkey-child",
            StepKind::EncInit => "enc-init",
            StepKind::EncAck => "enc-ack",
            StepKind::Rekey => "rekey",
            StepKind::AuthChallenge => "auth-challenge",
            StepKind::AuthReply => "auth-reply",
            StepKind::AuthPropose => "auth-propose",
        }
    }

    /// Whether this step travels sealed once the outer session is up.
    /// Key-exchange and announcement steps are cleartext by necessity.
    pub fn requires_sealing(&self) -> bool {
        matches!(
            self,
            StepKind::Rekey
                | StepKind::AuthChallenge
                | StepKind::AuthReply
                | StepKind::AuthPropose
        )
    }
}

/// Which end of the connection this engine drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    Initiator,
    Acceptor,
}

/// Outer (symmetric encryption) handshake progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OuterState {
    NotStarted,
    KeyExchangeSent,
    KeyExchangeAcked,
    Established,
    Failed,
}

impl OuterState {
    pub fn label(&self) -> &'static str {
        match self {
            OuterState::NotStarted => "not-started",
            OuterState::KeyExchangeSent => "key-exchange-sent",
            OuterState::KeyExchangeAcked => "key-exchange-acked",
            OuterState::Established => "established",
            OuterState::Failed => "failed",
        }
    }
}

/// Inner (identity authentication) handshake progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InnerState {
    NotStarted,
    ChallengeIssued,
    ReplyIssued,
    ProposeIssued,
    /// Authentication rounds done, mandatory rekey still pending.
    Rekeyed,
    Authenticated,
    Failed,
}

impl InnerState {
    pub fn label(&self) -> &'static str {
        match self {
            InnerState::NotStarted => "not-started",
            InnerState::ChallengeIssued => "challenge-issued",
            InnerState::ReplyIssued => "reply-issued",
            InnerState::ProposeIssued => "propose-issued",
            InnerState::Rekeyed => "rekeyed",
            InnerState::Authenticated => "authenticated",
            InnerState::Failed => "failed",
        }
    }
}

/// A handshake step to put on the wire.
#[derive(Debug, Clone)]
pub struct HandshakeStep {
    pub kind: StepKind,
    pub payload: Bytes,
}

impl HandshakeStep {
    fn new(kind: StepKind, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }
}

// ── Session engine ───────────────────────────────────────────────────────

/// Default sealed-byte volume after which the outbound direction must be
/// ratcheted.
pub const DEFAULT_REKEY_BYTE_LIMIT: u64 = 1 << 30;

/// Per-connection handshake and encryption state.
pub struct AeadSession {
    role: SessionRole,
    one_way: bool,
    outer: OuterState,
    inner: InnerState,
    own_identity: IdentityKeyPair,
    /// Peer identity we authenticate against (initiator side).
    expected_peer_key: Option<PublicKey>,
    /// Peer identity matched from the trust store (acceptor side).
    proposed_peer_key: Option<PublicKey>,
    /// Our EncInit ephemeral, held until the matching EncAck arrives.
    eph_local: Option<EphemeralKeyPair>,
    outbound: Option<DirectionKey>,
    inbound: Option<DirectionKey>,
    session_id: Option<[u8; 32]>,
    rekey_byte_limit: u64,
}

impl AeadSession {
    pub fn initiator(own_identity: IdentityKeyPair, one_way: bool) -> Self {
        Self::new(SessionRole::Initiator, own_identity, one_way)
    }

    pub fn acceptor(own_identity: IdentityKeyPair, one_way: bool) -> Self {
        Self::new(SessionRole::Acceptor, own_identity, one_way)
    }

    fn new(role: SessionRole, own_identity: IdentityKeyPair, one_way: bool) -> Self {
        Self {
            role,
            one_way,
            outer: OuterState::NotStarted,
            inner: InnerState::NotStarted,
            own_identity,
            expected_peer_key: None,
            proposed_peer_key: None,
            eph_local: None,
            outbound: None,
            inbound: None,
            session_id: None,
            rekey_byte_limit: DEFAULT_REKEY_BYTE_LIMIT,
        }
    }

    // ── Accessors ────────────────────────────────────────────────────────

    pub fn role(&self) -> SessionRole {
        self.role
    }

    pub fn outer_state(&self) -> OuterState {
        self.outer
    }

    /// Inner authentication progress.
    pub fn authentication_state(&self) -> InnerState {
        self.inner
    }

    /// Whether both directions are keyed and data can be sealed.
    pub fn session_established(&self) -> bool {
        self.outer == OuterState::Established
    }

    /// The key-exchange transcript digest, fixed once the outer session
    /// is established.
    pub fn session_id(&self) -> Option<[u8; 32]> {
        self.session_id
    }

    /// The authenticated peer identity, if the inner handshake finished and
    /// the mode identifies the peer.
    pub fn peer_identity(&self) -> Option<PublicKey> {
        if self.inner != InnerState::Authenticated {
            return None;
        }
        match self.role {
            SessionRole::Initiator => self.expected_peer_key,
            SessionRole::Acceptor => self.proposed_peer_key,
        }
    }

    /// Pin the identity the peer must prove. Must be set on the initiator
    /// before its authentication round starts.
    pub fn set_peer_identity(&mut self, key: PublicKey) {
        self.expected_peer_key = Some(key);
    }

    pub fn expected_peer_identity(&self) -> Option<PublicKey> {
        self.expected_peer_key
    }

    pub fn set_rekey_byte_limit(&mut self, limit: u64) {
        self.rekey_byte_limit = limit;
    }

    /// Whether sealing `pending` more bytes would cross the rekey volume.
    pub fn rekey_needed(&self, pending: usize) -> bool {
        match &self.outbound {
            Some(dir) => dir.bytes_processed().saturating_add(pending as u64) >= self.rekey_byte_limit,
            None => false,
        }
    }

    // ── Outer handshake ──────────────────────────────────────────────────

    /// Open the key exchange. Initiator only, from a fresh session.
    pub fn begin_key_exchange(&mut self) -> Result<HandshakeStep> {
        if self.role != SessionRole::Initiator {
            return Err(KeelTrustError::Handshake(
                "only the initiator opens the key exchange".into(),
            ));
        }
        if self.outer != OuterState::NotStarted {
            return Err(self.bad_transition("key-exchange-sent"));
        }

        let eph = EphemeralKeyPair::generate();
        let step = HandshakeStep::new(StepKind::EncInit, enc_init_payload(&eph));
        self.eph_local = Some(eph);
        self.outer = OuterState::KeyExchangeSent;
        Ok(step)
    }

    /// Feed one peer handshake step. Returns the steps to send in reply, in
    /// order. Any error poisons the session; no partial trust survives a
    /// failed handshake.
    pub fn process_peer_step(
        &mut self,
        kind: StepKind,
        payload: &[u8],
        trust: &TrustStore,
    ) -> Result<Vec<HandshakeStep>> {
        match self.step(kind, payload, trust) {
            Ok(steps) => Ok(steps),
            Err(e) => {
                self.outer = OuterState::Failed;
                self.inner = InnerState::Failed;
                Err(e)
            }
        }
    }

    fn step(
        &mut self,
        kind: StepKind,
        payload: &[u8],
        trust: &TrustStore,
    ) -> Result<Vec<HandshakeStep>> {
        match kind {
            StepKind::EncInit => self.on_enc_init(payload),
            StepKind::EncAck => self.on_enc_ack(payload),
            StepKind::Rekey => self.on_rekey_notice(payload),
            StepKind::AuthChallenge => self.on_auth_challenge(payload),
            StepKind::AuthReply => self.on_auth_reply(payload),
            StepKind::AuthPropose => self.on_auth_propose(payload, trust),
            StepKind::Start | StepKind::PresentPubKey | StepKind::PresentPubKeyChild => {
                Err(KeelTrustError::Handshake(format!(
                    "step {} is handled outside the session engine",
                    kind.label()
                )))
            }
        }
    }

    fn on_enc_init(&mut self, payload: &[u8]) -> Result<Vec<HandshakeStep>> {
        if !matches!(
            (self.role, self.outer),
            (SessionRole::Acceptor, OuterState::NotStarted)
                | (SessionRole::Initiator, OuterState::KeyExchangeAcked)
        ) {
            return Err(self.bad_transition("enc-init"));
        }
        let peer_eph = parse_enc_init(payload)?;

        match (self.role, self.outer) {
            // Peer opens its direction toward us; key our inbound, ack it,
            // and open the reverse direction in the same turn.
            (SessionRole::Acceptor, OuterState::NotStarted) => {
                let ack = EphemeralKeyPair::generate();
                let shared = ack.agree(&peer_eph)?;
                let peer_pub = peer_eph.serialize();
                let ack_pub = ack.public_compressed();
                let key = derive_direction_key(&shared, &peer_pub, &ack_pub)?;
                self.inbound = Some(DirectionKey::new(key));
                self.session_id = Some(session_id(&peer_pub, &ack_pub));

                let reverse = EphemeralKeyPair::generate();
                let steps = vec![
                    HandshakeStep::new(StepKind::EncAck, ack_pub.to_vec()),
                    HandshakeStep::new(StepKind::EncInit, enc_init_payload(&reverse)),
                ];
                self.eph_local = Some(reverse);
                self.outer = OuterState::KeyExchangeSent;
                Ok(steps)
            }
            // The acceptor's reverse-direction EncInit; key our inbound,
            // ack it, and the outer session is up. The initiator then
            // opens the identity rounds.
            (SessionRole::Initiator, OuterState::KeyExchangeAcked) => {
                let ack = EphemeralKeyPair::generate();
                let shared = ack.agree(&peer_eph)?;
                let peer_pub = peer_eph.serialize();
                let ack_pub = ack.public_compressed();
                let key = derive_direction_key(&shared, &peer_pub, &ack_pub)?;
                self.inbound = Some(DirectionKey::new(key));
                self.outer = OuterState::Established;

                let expected = self.expected_peer_key.ok_or_else(|| {
                    KeelTrustError::Handshake("peer identity not pinned before auth".into())
                })?;
                let challenge: [u8; 32] = Sha256::digest(expected.serialize()).into();
                self.inner = InnerState::ChallengeIssued;
                Ok(vec![
                    HandshakeStep::new(StepKind::EncAck, ack_pub.to_vec()),
                    HandshakeStep::new(StepKind::AuthChallenge, challenge.to_vec()),
                ])
            }
            _ => Err(self.bad_transition("enc-init")),
        }
    }

    fn on_enc_ack(&mut self, payload: &[u8]) -> Result<Vec<HandshakeStep>> {
        if self.outer != OuterState::KeyExchangeSent {
            return Err(self.bad_transition("enc-ack"));
        }
        if payload.len() != ENC_ACK_LEN {
            return Err(KeelTrustError::Handshake(format!(
                "enc-ack payload must be {} bytes, got {}",
                ENC_ACK_LEN,
                payload.len()
            )));
        }
        let peer_ack = validate_identity_key(payload)?;
        let eph = self
            .eph_local
            .take()
            .ok_or_else(|| KeelTrustError::Handshake("no pending key exchange".into()))?;
        let shared = eph.agree(&peer_ack)?;
        let own_pub = eph.public_compressed();
        let ack_pub = peer_ack.serialize();
        let key = derive_direction_key(&shared, &own_pub, &ack_pub)?;
        self.outbound = Some(DirectionKey::new(key));

        match (self.role, self.outer) {
            (SessionRole::Initiator, OuterState::KeyExchangeSent) => {
                self.session_id = Some(session_id(&own_pub, &ack_pub));
                self.outer = OuterState::KeyExchangeAcked;
                Ok(Vec::new())
            }
            (SessionRole::Acceptor, OuterState::KeyExchangeSent) => {
                self.outer = OuterState::Established;
                Ok(Vec::new())
            }
            _ => Err(self.bad_transition("enc-ack")),
        }
    }

    fn on_rekey_notice(&mut self, payload: &[u8]) -> Result<Vec<HandshakeStep>> {
        if self.outer != OuterState::Established {
            return Err(self.bad_transition("rekey"));
        }
        if payload.len() != REKEY_NOTICE_LEN || payload.iter().any(|&b| b != 0) {
            return Err(KeelTrustError::Handshake(
                "malformed rekey notice".into(),
            ));
        }
        match &mut self.inbound {
            Some(dir) => dir.ratchet()?,
            None => return Err(KeelTrustError::Handshake("no inbound direction".into())),
        }
        Ok(Vec::new())
    }

    // ── Inner handshake ──────────────────────────────────────────────────

    fn on_auth_challenge(&mut self, payload: &[u8]) -> Result<Vec<HandshakeStep>> {
        if self.outer != OuterState::Established {
            return Err(self.bad_transition("auth-challenge"));
        }
        if payload.len() != CHALLENGE_LEN {
            return Err(KeelTrustError::Handshake(format!(
                "auth challenge must be {} bytes, got {}",
                CHALLENGE_LEN,
                payload.len()
            )));
        }

        match (self.role, self.inner) {
            // First round: the initiator names the identity it expects us
            // to prove.
            (SessionRole::Acceptor, InnerState::NotStarted) => {
                let own_hash: [u8; 32] =
                    Sha256::digest(self.own_identity.public_key_compressed()).into();
                if payload != own_hash {
                    return Err(KeelTrustError::Handshake(
                        "challenge names a different identity".into(),
                    ));
                }
                let sig = self.own_identity.sign_digest(&self.auth_digest(1)?);
                self.inner = InnerState::ReplyIssued;
                Ok(vec![HandshakeStep::new(
                    StepKind::AuthReply,
                    sig.to_vec(),
                )])
            }
            // Second round: the acceptor either challenges our identity or
            // sends the anonymous all-zero challenge.
            (SessionRole::Initiator, InnerState::ProposeIssued) => {
                let own_hash: [u8; 32] =
                    Sha256::digest(self.own_identity.public_key_compressed()).into();
                if payload != ANON_CHALLENGE && payload != own_hash {
                    return Err(KeelTrustError::Handshake(
                        "challenge names a different identity".into(),
                    ));
                }
                let sig = self.own_identity.sign_digest(&self.auth_digest(2)?);
                self.inner = InnerState::Rekeyed;
                Ok(vec![HandshakeStep::new(
                    StepKind::AuthReply,
                    sig.to_vec(),
                )])
            }
            _ => Err(self.bad_transition("auth-challenge")),
        }
    }

    fn on_auth_reply(&mut self, payload: &[u8]) -> Result<Vec<HandshakeStep>> {
        if self.outer != OuterState::Established {
            return Err(self.bad_transition("auth-reply"));
        }
        if payload.len() != SIGNATURE_LEN {
            return Err(KeelTrustError::Handshake(format!(
                "auth reply must be {} bytes, got {}",
                SIGNATURE_LEN,
                payload.len()
            )));
        }

        match (self.role, self.inner) {
            // First round: the peer proves the identity we pinned.
            (SessionRole::Initiator, InnerState::ChallengeIssued) => {
                let expected = self.expected_peer_key.ok_or_else(|| {
                    KeelTrustError::Handshake("peer identity not pinned".into())
                })?;
                verify_digest(&expected, &self.auth_digest(1)?, payload)?;
                let own_hash: [u8; 32] =
                    Sha256::digest(self.own_identity.public_key_compressed()).into();
                self.inner = InnerState::ProposeIssued;
                Ok(vec![HandshakeStep::new(
                    StepKind::AuthPropose,
                    own_hash.to_vec(),
                )])
            }
            // Second round: the initiator answers our challenge. Anonymous
            // sessions accept the reply without a key to verify against.
            (SessionRole::Acceptor, InnerState::ProposeIssued) => {
                if !self.one_way {
                    let proposed = self.proposed_peer_key.ok_or_else(|| {
                        KeelTrustError::Handshake("no proposed peer identity".into())
                    })?;
                    verify_digest(&proposed, &self.auth_digest(2)?, payload)?;
                }
                self.inner = InnerState::Rekeyed;
                Ok(Vec::new())
            }
            _ => Err(self.bad_transition("auth-reply")),
        }
    }

    fn on_auth_propose(
        &mut self,
        payload: &[u8],
        trust: &TrustStore,
    ) -> Result<Vec<HandshakeStep>> {
        if self.outer != OuterState::Established {
            return Err(self.bad_transition("auth-propose"));
        }
        if !matches!((self.role, self.inner), (SessionRole::Acceptor, InnerState::ReplyIssued)) {
            return Err(self.bad_transition("auth-propose"));
        }
        if payload.len() != CHALLENGE_LEN {
            return Err(KeelTrustError::Handshake(format!(
                "auth propose must be {} bytes, got {}",
                CHALLENGE_LEN,
                payload.len()
            )));
        }

        let challenge: [u8; 32] = if self.one_way {
            ANON_CHALLENGE
        } else {
            let digest: [u8; 32] = payload
                .try_into()
                .map_err(|_| KeelTrustError::Handshake("bad propose digest".into()))?;
            let (_, key) = trust.find_by_key_hash(&digest).ok_or_else(|| {
                KeelTrustError::Handshake("proposed identity is not trusted".into())
            })?;
            self.proposed_peer_key = Some(*key);
            Sha256::digest(key.serialize()).into()
        };

        self.inner = InnerState::ProposeIssued;
        Ok(vec![HandshakeStep::new(
            StepKind::AuthChallenge,
            challenge.to_vec(),
        )])
    }

    // ── Sealing and rekey ────────────────────────────────────────────────

    /// Seal an outbound buffer under the current outbound direction key.
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        if self.outer != OuterState::Established {
            return Err(self.bad_transition("seal"));
        }
        match &mut self.outbound {
            Some(dir) => dir.seal(plaintext),
            None => Err(KeelTrustError::Handshake("no outbound direction".into())),
        }
    }

    /// Open an inbound sealed buffer.
    pub fn open(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        if self.outer != OuterState::Established {
            return Err(self.bad_transition("open"));
        }
        match &mut self.inbound {
            Some(dir) => dir.open(ciphertext),
            None => Err(KeelTrustError::Handshake("no inbound direction".into())),
        }
    }

    /// Ratchet the outbound direction. The caller must already have sent a
    /// rekey notice sealed under the outgoing key. Completes authentication
    /// when this is the mandatory post-auth rekey.
    pub fn rekey_outer_session(&mut self) -> Result<()> {
        if self.outer != OuterState::Established {
            return Err(self.bad_transition("rekey"));
        }
        match &mut self.outbound {
            Some(dir) => dir.ratchet()?,
            None => return Err(KeelTrustError::Handshake("no outbound direction".into())),
        }
        if self.inner == InnerState::Rekeyed {
            self.inner = InnerState::Authenticated;
        }
        Ok(())
    }

    // ── Helpers ──────────────────────────────────────────────────────────

    fn auth_digest(&self, round: u8) -> Result<[u8; 32]> {
        let session_id = self
            .session_id
            .ok_or_else(|| KeelTrustError::Handshake("no session id".into()))?;
        let mut hasher = Sha256::new();
        hasher.update(b"keel auth v1");
        hasher.update([round]);
        hasher.update(session_id);
        Ok(hasher.finalize().into())
    }

    fn bad_transition(&self, to: &str) -> KeelTrustError {
        KeelTrustError::InvalidStateTransition {
            from: format!("{}/{}", self.outer.label(), self.inner.label()),
            to: to.into(),
        }
    }
}

fn enc_init_payload(eph: &EphemeralKeyPair) -> Vec<u8> {
    let mut payload = Vec::with_capacity(ENC_INIT_LEN);
    payload.extend_from_slice(&eph.public_compressed());
    payload.push(CIPHER_SUITE_CHACHA20POLY1305);
    payload
}

fn parse_enc_init(payload: &[u8]) -> Result<PublicKey> {
    if payload.len() != ENC_INIT_LEN {
        return Err(KeelTrustError::Handshake(format!(
            "enc-init payload must be {} bytes, got {}",
            ENC_INIT_LEN,
            payload.len()
        )));
    }
    let suite = payload[ENC_INIT_LEN - 1];
    if suite != CIPHER_SUITE_CHACHA20POLY1305 {
        return Err(KeelTrustError::UnknownCipherSuite(suite));
    }
    validate_identity_key(&payload[..COMPRESSED_KEY_LEN])
}

/// Direction A transcript hash, shared by both endpoints and bound into the
/// authentication digests.
fn session_id(init_pub: &[u8; 33], ack_pub: &[u8; 33]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"keel session v1");
    hasher.update(init_pub);
    hasher.update(ack_pub);
    hasher.finalize().into()
}
