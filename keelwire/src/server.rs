// Server-side transport: many inbound connections, each with its own
// handshake engine and upkeep clocks.
//
// Every client is fully isolated. A protocol error, a timeout or a failed
// handshake drops exactly that client and leaves the rest untouched. The
// server opens each handshake by sending Start plus its own identity
// announcement; from there the client drives the rounds.

use std::collections::HashMap;
use std::time::Instant;

use bytes::Bytes;
use keeltrust::session::REKEY_NOTICE;
use keeltrust::{AeadSession, IdentityKeyPair, InnerState, Peer, PublicKey, StepKind, TrustStore};
use tracing::{debug, error, info, warn};

use crate::adapter::{ServerCallbacks, ServerSendFn, TrustedClientsProvider};
use crate::config::{AuthMode, CookieMode, KeyPersistence, TransportConfig};
use crate::cookie::{read_peer_cookie, CookieProducer};
use crate::error::{KeelWireError, Result};
use crate::packet::{
    build_sealed, open_sealed, FrameAccumulator, Packet, PacketClass, PacketType,
};
use crate::policy::RekeyClock;

/// Trust-store name for a client key consumed from a cookie file.
const COOKIE_CLIENT_NAME: &str = "cookie-client";

enum Flow {
    Continue,
    Closed,
}

struct ClientConn {
    engine: AeadSession,
    accumulator: FrameAccumulator,
    created: Instant,
    last_seen: Instant,
    rekey: RekeyClock,
}

impl ClientConn {
    fn authenticated(&self) -> bool {
        self.engine.authentication_state() == InnerState::Authenticated
    }
}

/// Server endpoint of the secure transport.
pub struct ServerTransport {
    config: TransportConfig,
    trust: TrustStore,
    callbacks: ServerCallbacks,
    send: ServerSendFn,
    clients: HashMap<String, ClientConn>,
    _cookie: Option<CookieProducer>,
}

impl ServerTransport {
    pub fn new(
        config: TransportConfig,
        callbacks: ServerCallbacks,
        send: ServerSendFn,
        trusted_clients: Option<TrustedClientsProvider>,
    ) -> Result<Self> {
        let mut trust = match &config.key_persistence {
            KeyPersistence::Ephemeral => TrustStore::with_ephemeral_key(),
            KeyPersistence::Persistent { dir, name } => {
                TrustStore::new(IdentityKeyPair::load_or_create(dir, name)?)
            }
        };
        if let Some(provider) = &trusted_clients {
            trust.replace_all_but_own(provider())?;
        }

        let mut cookie_file = None;
        match &config.cookie {
            CookieMode::Disabled => {}
            CookieMode::Produce(path) => {
                cookie_file = Some(CookieProducer::create(path, &trust.own_public_key())?);
            }
            CookieMode::Consume(path) => {
                let key = read_peer_cookie(path)?;
                trust.add_peer(Peer::from_public_key(COOKIE_CLIENT_NAME, key))?;
            }
        }

        Ok(Self {
            config,
            trust,
            callbacks,
            send,
            clients: HashMap::new(),
            _cookie: cookie_file,
        })
    }

    /// This endpoint's identity key fingerprint.
    pub fn own_key_hex(&self) -> String {
        self.trust.own_key_hex()
    }

    pub fn trust_store_mut(&mut self) -> &mut TrustStore {
        &mut self.trust
    }

    /// Swap the baseline trusted client set. Already-authenticated
    /// connections keep running; the new set gates future handshakes.
    pub fn force_trusted_clients(&mut self, peers: Vec<Peer>) -> Result<()> {
        self.trust.replace_all_but_own(peers)?;
        Ok(())
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn is_client_authenticated(&self, id: &str) -> bool {
        self.clients.get(id).map(ClientConn::authenticated).unwrap_or(false)
    }

    /// The identity key a client authenticated with, once it did.
    pub fn client_key(&self, id: &str) -> Option<PublicKey> {
        self.clients.get(id).and_then(|c| c.engine.peer_identity())
    }

    // ── Lifecycle ────────────────────────────────────────────────────────

    /// Register a freshly accepted socket under `id` (conventionally the
    /// peer address) and open the handshake toward it.
    pub fn add_client(&mut self, id: &str) -> Result<()> {
        if self.clients.contains_key(id) {
            return Err(KeelWireError::ClientAlreadyExists(id.to_string()));
        }

        let one_way = self.config.auth_mode == AuthMode::OneWay;
        let mut engine = AeadSession::acceptor(self.trust.own_keypair().clone(), one_way);
        engine.set_rekey_byte_limit(self.config.rekey_byte_limit);

        let start = Packet::new(PacketType::Start, Bytes::new()).build();
        if !(self.send)(id, &start) {
            return Err(KeelWireError::SendFailed);
        }
        if one_way {
            // Two-way deployments pre-share the server key; announcing it
            // unencrypted is only needed for trust-on-first-use clients.
            let announce = Packet::new(
                PacketType::PresentPubKey,
                Bytes::copy_from_slice(&self.trust.own_public_key().serialize()),
            )
            .build();
            if !(self.send)(id, &announce) {
                return Err(KeelWireError::SendFailed);
            }
        }

        let now = Instant::now();
        self.clients.insert(
            id.to_string(),
            ClientConn {
                engine,
                accumulator: FrameAccumulator::new(),
                created: now,
                last_seen: now,
                rekey: RekeyClock::new(now),
            },
        );
        info!(client = id, "client registered, handshake opened");
        Ok(())
    }

    /// Drop a client. Sends a best-effort disconnect notice; unknown ids
    /// are a no-op.
    pub fn remove_client(&mut self, id: &str) {
        let Some(mut conn) = self.clients.remove(id) else {
            return;
        };
        let was_authenticated = conn.authenticated();
        let wire = if conn.engine.session_established() {
            build_sealed(PacketType::Disconnect, Bytes::new(), &mut conn.engine).ok()
        } else {
            Some(Packet::new(PacketType::Disconnect, Bytes::new()).build())
        };
        if let Some(wire) = wire {
            let _ = (self.send)(id, &wire);
        }
        debug!(client = id, "client removed");
        if was_authenticated {
            if let Some(cb) = &mut self.callbacks.on_client_disconnected {
                cb(id);
            }
        }
    }

    /// Send one application payload to an authenticated client. Returns
    /// false when the client is unknown, not yet authenticated, or the wire
    /// refused the buffer.
    pub fn send(&mut self, id: &str, data: &[u8]) -> bool {
        let Some(mut conn) = self.clients.remove(id) else {
            return false;
        };
        if !conn.authenticated() {
            self.clients.insert(id.to_string(), conn);
            return false;
        }
        match self.send_app(id, &mut conn, Bytes::copy_from_slice(data)) {
            Ok(()) => {
                self.clients.insert(id.to_string(), conn);
                true
            }
            Err(e) => {
                self.fail_client(id, conn, e);
                false
            }
        }
    }

    /// Fan one payload out to every authenticated client. Returns the ids
    /// that accepted it.
    pub fn send_to_all(&mut self, data: &[u8]) -> Vec<String> {
        let ids: Vec<String> = self
            .clients
            .iter()
            .filter(|(_, c)| c.authenticated())
            .map(|(id, _)| id.clone())
            .collect();
        ids.into_iter().filter(|id| self.send(id, data)).collect()
    }

    /// Feed raw bytes read from the socket of client `id`.
    pub fn process_incoming(&mut self, id: &str, bytes: &[u8]) {
        let Some(mut conn) = self.clients.remove(id) else {
            warn!(client = id, "bytes for unknown client dropped");
            return;
        };
        conn.last_seen = Instant::now();
        conn.accumulator.push(bytes);
        loop {
            let frame = match conn.accumulator.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    self.fail_client(id, conn, e);
                    return;
                }
            };
            match self.handle_frame(id, &mut conn, &frame) {
                Ok(Flow::Continue) => {}
                Ok(Flow::Closed) => return,
                Err(e) => {
                    self.fail_client(id, conn, e);
                    return;
                }
            }
        }
        self.clients.insert(id.to_string(), conn);
    }

    /// Drive handshake timeouts, liveness sweeps and scheduled rekeys
    /// across all clients. Call at a cadence well below the heartbeat
    /// interval.
    pub fn periodic_check(&mut self) {
        let now = Instant::now();
        let liveness_window = self.config.heartbeat_interval * 2;

        let ids: Vec<String> = self.clients.keys().cloned().collect();
        for id in ids {
            let Some(mut conn) = self.clients.remove(&id) else {
                continue;
            };

            if !conn.authenticated() {
                if now.saturating_duration_since(conn.created) > self.config.handshake_timeout {
                    self.fail_client(&id, conn, KeelWireError::ConnectionTimeout);
                } else {
                    self.clients.insert(id, conn);
                }
                continue;
            }

            if now.saturating_duration_since(conn.last_seen) > liveness_window {
                self.fail_client(&id, conn, KeelWireError::HeartbeatWaitFailed);
                continue;
            }

            if conn.rekey.due(now, self.config.rekey_interval) {
                if let Err(e) = self.rekey_now(&id, &mut conn, now) {
                    self.fail_client(&id, conn, e);
                    continue;
                }
            }

            self.clients.insert(id, conn);
        }
    }

    // ── Frame handling ───────────────────────────────────────────────────

    fn handle_frame(&mut self, id: &str, conn: &mut ClientConn, frame: &[u8]) -> Result<Flow> {
        let packet = if conn.engine.session_established() {
            open_sealed(frame, &mut conn.engine)?
        } else {
            Packet::parse(frame)?
        };

        match packet.classify() {
            PacketClass::Handshake(step) => {
                self.handle_handshake_step(id, conn, step, &packet.payload)?;
                Ok(Flow::Continue)
            }
            PacketClass::Application(PacketType::Disconnect) => {
                info!(client = id, "client disconnected");
                if let Some(cb) = &mut self.callbacks.on_client_disconnected {
                    cb(id);
                }
                Ok(Flow::Closed)
            }
            PacketClass::Application(ptype) => {
                if !conn.authenticated() {
                    return Err(KeelWireError::ProtocolViolation(format!(
                        "application packet {ptype:?} before authentication"
                    )));
                }
                match ptype {
                    PacketType::SinglePacket => {
                        if let Some(cb) = &mut self.callbacks.on_data {
                            cb(id, &packet.payload);
                        }
                        Ok(Flow::Continue)
                    }
                    PacketType::Heartbeat => {
                        // The client drives liveness; echo every beat back.
                        let wire =
                            build_sealed(PacketType::Heartbeat, Bytes::new(), &mut conn.engine)?;
                        if !(self.send)(id, &wire) {
                            return Err(KeelWireError::SendFailed);
                        }
                        Ok(Flow::Continue)
                    }
                    _ => Err(KeelWireError::ProtocolViolation(format!(
                        "unexpected application packet {ptype:?}"
                    ))),
                }
            }
        }
    }

    fn handle_handshake_step(
        &mut self,
        id: &str,
        conn: &mut ClientConn,
        step: StepKind,
        payload: &[u8],
    ) -> Result<()> {
        match step {
            StepKind::Start | StepKind::PresentPubKey | StepKind::PresentPubKeyChild => {
                Err(KeelWireError::HandshakeFailed(format!(
                    "client sent server-only step {}",
                    step.label()
                )))
            }
            _ => {
                let replies = conn.engine.process_peer_step(step, payload, &self.trust)?;
                for reply in replies {
                    self.dispatch_step(id, conn, reply)?;
                }
                if conn.engine.authentication_state() == InnerState::Rekeyed {
                    self.complete_authentication(id, conn)?;
                }
                Ok(())
            }
        }
    }

    fn dispatch_step(
        &mut self,
        id: &str,
        conn: &mut ClientConn,
        step: keeltrust::HandshakeStep,
    ) -> Result<()> {
        let ptype = PacketType::from_step(step.kind);
        let wire = if step.kind.requires_sealing() {
            build_sealed(ptype, step.payload, &mut conn.engine)?
        } else {
            Packet::new(ptype, step.payload).build()
        };
        if !(self.send)(id, &wire) {
            return Err(KeelWireError::SendFailed);
        }
        Ok(())
    }

    /// The mandatory post-auth rekey, then the authenticated callback.
    fn complete_authentication(&mut self, id: &str, conn: &mut ClientConn) -> Result<()> {
        let now = Instant::now();
        self.rekey_now(id, conn, now)?;
        conn.last_seen = now;

        info!(client = id, "client authenticated");
        if let Some(cb) = &mut self.callbacks.on_client_authenticated {
            cb(id);
        }
        Ok(())
    }

    /// Notify the client, then ratchet our outbound direction.
    fn rekey_now(&mut self, id: &str, conn: &mut ClientConn, now: Instant) -> Result<()> {
        let wire = build_sealed(PacketType::Rekey, REKEY_NOTICE.to_vec(), &mut conn.engine)?;
        if !(self.send)(id, &wire) {
            return Err(KeelWireError::SendFailed);
        }
        conn.engine.rekey_outer_session()?;
        conn.rekey.mark(now);
        debug!(client = id, "outbound direction rekeyed");
        Ok(())
    }

    fn send_app(&mut self, id: &str, conn: &mut ClientConn, payload: Bytes) -> Result<()> {
        if conn.engine.rekey_needed(payload.len()) {
            self.rekey_now(id, conn, Instant::now())?;
        }
        let wire = build_sealed(PacketType::SinglePacket, payload, &mut conn.engine)?;
        if !(self.send)(id, &wire) {
            return Err(KeelWireError::SendFailed);
        }
        Ok(())
    }

    /// Drop one client and report the error class exactly once. The other
    /// clients are untouched.
    fn fail_client(&mut self, id: &str, conn: ClientConn, err: KeelWireError) {
        error!(client = id, error = %err, "client connection failed");
        let kind = err.kind();
        drop(conn);
        if let Some(cb) = &mut self.callbacks.on_client_error {
            cb(id, kind);
        }
    }
}
