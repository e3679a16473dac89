// Client-side transport: one outbound connection, driven by raw bytes in
// and a send hook out.
//
// The lifecycle mirrors the wire protocol: the server opens with Start and
// announces its key, the client runs the key exchange and identity rounds,
// both sides force a rekey, and only then does queued application data
// flow. Any error on the way tears the connection down; there is no
// half-trusted state to resume from.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use keeltrust::session::REKEY_NOTICE;
use keeltrust::{
    AeadSession, IdentityKeyPair, InnerState, Peer, PendingDecision, PublicKey, StepKind,
    TrustStore,
};
use tracing::{debug, error, info, warn};

use crate::adapter::{ClientCallbacks, ClientSendFn};
use crate::config::{AuthMode, CookieMode, KeyPersistence, TransportConfig};
use crate::cookie::{read_peer_cookie, CookieProducer};
use crate::error::{KeelWireError, Result};
use crate::packet::{
    build_sealed, open_sealed, FrameAccumulator, Packet, PacketClass, PacketType,
};
use crate::policy::{HeartbeatAction, HeartbeatClock, RekeyClock};

enum Flow {
    Continue,
    Closed,
}

struct Connection {
    peer_name: String,
    engine: AeadSession,
    accumulator: FrameAccumulator,
    /// Application payloads queued while the handshake runs, flushed FIFO
    /// on authentication.
    queue: VecDeque<Bytes>,
    heartbeat: HeartbeatClock,
    rekey: RekeyClock,
    opened_at: Instant,
    pending_decision: Option<Arc<PendingDecision>>,
    /// Key pinned from a consumed cookie; the announcement must match it.
    cookie_pin: Option<PublicKey>,
    _cookie: Option<CookieProducer>,
}

/// Client endpoint of the secure transport.
pub struct ClientTransport {
    config: TransportConfig,
    trust: TrustStore,
    callbacks: ClientCallbacks,
    send: ClientSendFn,
    conn: Option<Connection>,
}

impl ClientTransport {
    pub fn new(
        config: TransportConfig,
        callbacks: ClientCallbacks,
        send: ClientSendFn,
    ) -> Result<Self> {
        let trust = match &config.key_persistence {
            KeyPersistence::Ephemeral => TrustStore::with_ephemeral_key(),
            KeyPersistence::Persistent { dir, name } => {
                TrustStore::new(IdentityKeyPair::load_or_create(dir, name)?)
            }
        };
        Ok(Self {
            config,
            trust,
            callbacks,
            send,
            conn: None,
        })
    }

    /// This endpoint's identity key fingerprint.
    pub fn own_key_hex(&self) -> String {
        self.trust.own_key_hex()
    }

    pub fn trust_store_mut(&mut self) -> &mut TrustStore {
        &mut self.trust
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    pub fn is_authenticated(&self) -> bool {
        self.conn
            .as_ref()
            .map(|c| c.engine.authentication_state() == InnerState::Authenticated)
            .unwrap_or(false)
    }

    /// The peer key this connection authenticated, once it did.
    pub fn peer_key(&self) -> Option<PublicKey> {
        self.conn.as_ref().and_then(|c| c.engine.peer_identity())
    }

    // ── Lifecycle ────────────────────────────────────────────────────────

    /// Attach to a freshly connected socket toward `peer_name`
    /// (conventionally `host:port`). The handshake starts when the server's
    /// Start packet arrives.
    pub fn open(&mut self, peer_name: &str) -> Result<()> {
        if self.conn.is_some() {
            return Err(KeelWireError::ProtocolViolation(
                "already connected".into(),
            ));
        }

        let mut cookie_pin = None;
        let mut cookie_file = None;
        match &self.config.cookie {
            CookieMode::Disabled => {}
            CookieMode::Consume(path) => {
                let key = read_peer_cookie(path)?;
                self.trust.add_peer(Peer::from_public_key(peer_name, key))?;
                cookie_pin = Some(key);
            }
            CookieMode::Produce(path) => {
                cookie_file = Some(CookieProducer::create(path, &self.trust.own_public_key())?);
            }
        }

        let one_way = self.config.auth_mode == AuthMode::OneWay;
        let mut engine = AeadSession::initiator(self.trust.own_keypair().clone(), one_way);
        engine.set_rekey_byte_limit(self.config.rekey_byte_limit);
        if let Some(key) = self.trust.get(peer_name) {
            engine.set_peer_identity(*key);
        }

        let now = Instant::now();
        self.conn = Some(Connection {
            peer_name: peer_name.to_string(),
            engine,
            accumulator: FrameAccumulator::new(),
            queue: VecDeque::new(),
            heartbeat: HeartbeatClock::new(now),
            rekey: RekeyClock::new(now),
            opened_at: now,
            pending_decision: None,
            cookie_pin,
            _cookie: cookie_file,
        });
        info!(peer = peer_name, "connection opened, awaiting handshake");
        Ok(())
    }

    /// Detach from the socket. Sends a best-effort disconnect notice and
    /// drops all connection state.
    pub fn close(&mut self) {
        let Some(mut conn) = self.conn.take() else {
            return;
        };
        let wire = if conn.engine.session_established() {
            build_sealed(PacketType::Disconnect, Bytes::new(), &mut conn.engine).ok()
        } else {
            Some(Packet::new(PacketType::Disconnect, Bytes::new()).build())
        };
        if let Some(wire) = wire {
            let _ = (self.send)(&wire);
        }
        if let Some(decision) = &conn.pending_decision {
            decision.force_reject();
        }
        debug!(peer = %conn.peer_name, "connection closed");
    }

    /// Queue or send one application payload. Returns false only when the
    /// connection is gone or the wire refused the buffer.
    pub fn send(&mut self, data: &[u8]) -> bool {
        let Some(mut conn) = self.conn.take() else {
            return false;
        };
        if conn.engine.authentication_state() != InnerState::Authenticated {
            conn.queue.push_back(Bytes::copy_from_slice(data));
            self.conn = Some(conn);
            return true;
        }
        match self.send_app(&mut conn, Bytes::copy_from_slice(data)) {
            Ok(()) => {
                self.conn = Some(conn);
                true
            }
            Err(e) => {
                self.fail(conn, e);
                false
            }
        }
    }

    /// Feed raw bytes read from the socket.
    pub fn on_raw_bytes(&mut self, bytes: &[u8]) {
        let Some(mut conn) = self.conn.take() else {
            return;
        };
        conn.accumulator.push(bytes);
        loop {
            let frame = match conn.accumulator.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    self.fail(conn, e);
                    return;
                }
            };
            match self.handle_frame(&mut conn, &frame) {
                Ok(Flow::Continue) => {}
                Ok(Flow::Closed) => return,
                Err(e) => {
                    self.fail(conn, e);
                    return;
                }
            }
        }
        self.conn = Some(conn);
    }

    /// Drive timeouts, heartbeats and scheduled rekeys. Call at a cadence
    /// well below the heartbeat interval.
    pub fn periodic_check(&mut self) {
        let Some(mut conn) = self.conn.take() else {
            return;
        };
        let now = Instant::now();

        if conn.engine.authentication_state() != InnerState::Authenticated {
            if now.saturating_duration_since(conn.opened_at) > self.config.handshake_timeout {
                self.fail(conn, KeelWireError::ConnectionTimeout);
                return;
            }
            self.conn = Some(conn);
            return;
        }

        if conn.rekey.due(now, self.config.rekey_interval) {
            if let Err(e) = self.rekey_now(&mut conn, now) {
                self.fail(conn, e);
                return;
            }
        }

        match conn.heartbeat.poll(now, self.config.heartbeat_interval) {
            HeartbeatAction::Idle => {}
            HeartbeatAction::SendHeartbeat => {
                match build_sealed(PacketType::Heartbeat, Bytes::new(), &mut conn.engine) {
                    Ok(wire) => {
                        if (self.send)(&wire) {
                            conn.heartbeat.mark_sent(now);
                        } else {
                            self.fail(conn, KeelWireError::SendFailed);
                            return;
                        }
                    }
                    Err(e) => {
                        self.fail(conn, e);
                        return;
                    }
                }
            }
            HeartbeatAction::Failed => {
                self.fail(conn, KeelWireError::HeartbeatWaitFailed);
                return;
            }
        }

        self.conn = Some(conn);
    }

    // ── Frame handling ───────────────────────────────────────────────────

    fn handle_frame(&mut self, conn: &mut Connection, frame: &[u8]) -> Result<Flow> {
        let packet = if conn.engine.session_established() {
            open_sealed(frame, &mut conn.engine)?
        } else {
            Packet::parse(frame)?
        };

        match packet.classify() {
            PacketClass::Handshake(step) => {
                self.handle_handshake_step(conn, step, &packet.payload)?;
                Ok(Flow::Continue)
            }
            PacketClass::Application(PacketType::Disconnect) => {
                info!(peer = %conn.peer_name, "peer disconnected");
                if let Some(decision) = &conn.pending_decision {
                    decision.force_reject();
                }
                if let Some(cb) = &mut self.callbacks.on_disconnected {
                    cb();
                }
                Ok(Flow::Closed)
            }
            PacketClass::Application(ptype) => {
                if conn.engine.authentication_state() != InnerState::Authenticated {
                    return Err(KeelWireError::ProtocolViolation(format!(
                        "application packet {ptype:?} before authentication"
                    )));
                }
                match ptype {
                    PacketType::SinglePacket => {
                        if let Some(cb) = &mut self.callbacks.on_data {
                            cb(&packet.payload);
                        }
                        Ok(Flow::Continue)
                    }
                    PacketType::Heartbeat => {
                        conn.heartbeat.mark_reply(Instant::now());
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
        conn: &mut Connection,
        step: StepKind,
        payload: &[u8],
    ) -> Result<()> {
        match step {
            StepKind::Start => {
                let init = conn.engine.begin_key_exchange()?;
                self.dispatch_step(conn, init)
            }
            StepKind::PresentPubKey => self.handle_key_announcement(conn, payload),
            StepKind::PresentPubKeyChild => Err(KeelWireError::HandshakeFailed(
                "child key announcements are not supported".into(),
            )),
            _ => {
                let replies = conn.engine.process_peer_step(step, payload, &self.trust)?;
                for reply in replies {
                    self.dispatch_step(conn, reply)?;
                }
                if conn.engine.authentication_state() == InnerState::Rekeyed {
                    self.complete_authentication(conn)?;
                }
                Ok(())
            }
        }
    }

    /// The server's identity announcement: pin match, known key, or the
    /// trust-on-first-use prompt.
    fn handle_key_announcement(&mut self, conn: &mut Connection, payload: &[u8]) -> Result<()> {
        let announced = keeltrust::validate_identity_key(payload)?;

        if let Some(pin) = conn.cookie_pin {
            if announced != pin {
                return Err(KeelWireError::HandshakeFailed(
                    "announced key does not match the cookie".into(),
                ));
            }
            conn.engine.set_peer_identity(announced);
            return Ok(());
        }

        let known = self.trust.get(&conn.peer_name).copied();
        if known == Some(announced) {
            conn.engine.set_peer_identity(announced);
            return Ok(());
        }

        let old_hex = known.map(|k| hex_key(&k));
        let new_hex = hex_key(&announced);
        let decision = Arc::new(PendingDecision::new());
        conn.pending_decision = Some(Arc::clone(&decision));

        match &mut self.callbacks.on_new_peer_key {
            Some(cb) => cb(old_hex.as_deref(), &new_hex, &conn.peer_name, &decision),
            None => {
                warn!(
                    peer = %conn.peer_name,
                    key = %new_hex,
                    "no key prompt installed, accepting announced key"
                );
                decision.resolve(true);
            }
        }

        let accepted = decision.wait();
        conn.pending_decision = None;
        if !accepted {
            return Err(KeelWireError::HandshakeFailed(
                "announced peer key was rejected".into(),
            ));
        }

        self.trust
            .add_peer(Peer::from_public_key(conn.peer_name.clone(), announced))?;
        conn.engine.set_peer_identity(announced);
        info!(peer = %conn.peer_name, key = %new_hex, "peer key accepted");
        Ok(())
    }

    fn dispatch_step(&mut self, conn: &mut Connection, step: keeltrust::HandshakeStep) -> Result<()> {
        let ptype = PacketType::from_step(step.kind);
        let wire = if step.kind.requires_sealing() {
            build_sealed(ptype, step.payload, &mut conn.engine)?
        } else {
            Packet::new(ptype, step.payload).build()
        };
        if !(self.send)(&wire) {
            return Err(KeelWireError::SendFailed);
        }
        Ok(())
    }

    /// The mandatory post-auth rekey, then the queued backlog, then the
    /// authenticated callback.
    fn complete_authentication(&mut self, conn: &mut Connection) -> Result<()> {
        let now = Instant::now();
        self.rekey_now(conn, now)?;
        conn.heartbeat = HeartbeatClock::new(now);

        while let Some(payload) = conn.queue.pop_front() {
            self.send_app(conn, payload)?;
        }

        info!(peer = %conn.peer_name, "authenticated");
        if let Some(cb) = &mut self.callbacks.on_authenticated {
            cb();
        }
        Ok(())
    }

    /// Notify the peer, then ratchet our outbound direction.
    fn rekey_now(&mut self, conn: &mut Connection, now: Instant) -> Result<()> {
        let wire = build_sealed(PacketType::Rekey, REKEY_NOTICE.to_vec(), &mut conn.engine)?;
        if !(self.send)(&wire) {
            return Err(KeelWireError::SendFailed);
        }
        conn.engine.rekey_outer_session()?;
        conn.rekey.mark(now);
        debug!(peer = %conn.peer_name, "outbound direction rekeyed");
        Ok(())
    }

    fn send_app(&mut self, conn: &mut Connection, payload: Bytes) -> Result<()> {
        if conn.engine.rekey_needed(payload.len()) {
            self.rekey_now(conn, Instant::now())?;
        }
        let wire = build_sealed(PacketType::SinglePacket, payload, &mut conn.engine)?;
        if !(self.send)(&wire) {
            return Err(KeelWireError::SendFailed);
        }
        Ok(())
    }

    /// Tear the connection down and report the error class exactly once.
    fn fail(&mut self, conn: Connection, err: KeelWireError) {
        error!(peer = %conn.peer_name, error = %err, "connection failed");
        if let Some(decision) = &conn.pending_decision {
            decision.force_reject();
        }
        let kind = err.kind();
        drop(conn);
        if let Some(cb) = &mut self.callbacks.on_error {
            cb(kind);
        }
    }
}

fn hex_key(key: &PublicKey) -> String {
    let bytes = key.serialize();
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn sink() -> (ClientSendFn, Arc<Mutex<Vec<Vec<u8>>>>) {
        let wire = Arc::new(Mutex::new(Vec::new()));
        let tx = Arc::clone(&wire);
        let send: ClientSendFn = Box::new(move |buf| {
            tx.lock().push(buf.to_vec());
            true
        });
        (send, wire)
    }

    #[test]
    fn open_twice_is_rejected() {
        let (send, _) = sink();
        let mut client =
            ClientTransport::new(TransportConfig::default(), ClientCallbacks::default(), send)
                .unwrap();
        client.open("127.0.0.1:7700").unwrap();
        assert!(client.open("127.0.0.1:7700").is_err());
    }

    #[test]
    fn pre_auth_sends_are_queued_not_wired() {
        let (send, wire) = sink();
        let mut client =
            ClientTransport::new(TransportConfig::default(), ClientCallbacks::default(), send)
                .unwrap();
        client.open("127.0.0.1:7700").unwrap();

        assert!(client.send(b"early order"));
        assert!(client.send(b"second order"));
        assert!(wire.lock().is_empty());
        assert!(!client.is_authenticated());
    }

    #[test]
    fn send_without_connection_fails() {
        let (send, _) = sink();
        let mut client =
            ClientTransport::new(TransportConfig::default(), ClientCallbacks::default(), send)
                .unwrap();
        assert!(!client.send(b"nothing"));
    }

    #[test]
    fn start_packet_triggers_key_exchange() {
        let (send, wire) = sink();
        let mut client =
            ClientTransport::new(TransportConfig::default(), ClientCallbacks::default(), send)
                .unwrap();
        client.open("127.0.0.1:7700").unwrap();

        let start = Packet::new(PacketType::Start, Bytes::new()).build();
        client.on_raw_bytes(&start);

        let sent = wire.lock();
        assert_eq!(sent.len(), 1);
        let packet = Packet::parse(&sent[0]).unwrap();
        assert_eq!(packet.ptype, PacketType::EncInit);
    }

    #[test]
    fn garbage_frame_reports_serialization_error() {
        let (send, _) = sink();
        let errors = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&errors);
        let callbacks = ClientCallbacks {
            on_error: Some(Box::new(move |kind| seen.lock().push(kind))),
            ..Default::default()
        };
        let mut client =
            ClientTransport::new(TransportConfig::default(), callbacks, send).unwrap();
        client.open("127.0.0.1:7700").unwrap();

        // A complete frame whose type byte is outside every range.
        let mut frame = vec![0, 0, 0, 2];
        frame.extend_from_slice(&[0x7F, 0x00]);
        client.on_raw_bytes(&frame);

        assert!(!client.is_connected());
        assert_eq!(errors.lock().as_slice(), &[crate::error::ErrorKind::SerializationFailed]);
    }

    #[test]
    fn close_is_idempotent_and_notifies_peer() {
        let (send, wire) = sink();
        let mut client =
            ClientTransport::new(TransportConfig::default(), ClientCallbacks::default(), send)
                .unwrap();
        client.open("127.0.0.1:7700").unwrap();
        client.close();
        client.close();

        let sent = wire.lock();
        assert_eq!(sent.len(), 1);
        let packet = Packet::parse(&sent[0]).unwrap();
        assert_eq!(packet.ptype, PacketType::Disconnect);
    }
}
