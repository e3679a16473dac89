// Integration tests: the public KeelTrust surface wired together the way a
// transport uses it.

use keeltrust::session::REKEY_NOTICE;
use keeltrust::{
    AeadSession, HandshakeStep, IdentityKeyPair, InnerState, Peer, PendingDecision, StepKind,
    TrustStore,
};
use std::sync::Arc;

// ── Helpers ──────────────────────────────────────────────────────────────

fn relay(from: &mut AeadSession, to: &mut AeadSession, step: &HandshakeStep) -> Vec<u8> {
    if step.kind.requires_sealing() {
        let sealed = from.seal(&step.payload).unwrap();
        to.open(&sealed).unwrap()
    } else {
        step.payload.to_vec()
    }
}

fn finish_rekey(from: &mut AeadSession, to: &mut AeadSession, to_trust: &TrustStore) {
    if from.authentication_state() == InnerState::Rekeyed {
        let sealed = from.seal(&REKEY_NOTICE).unwrap();
        from.rekey_outer_session().unwrap();
        let payload = to.open(&sealed).unwrap();
        to.process_peer_step(StepKind::Rekey, &payload, to_trust)
            .unwrap();
    }
}

fn run_handshake(
    initiator: &mut AeadSession,
    acceptor: &mut AeadSession,
    initiator_trust: &TrustStore,
    acceptor_trust: &TrustStore,
) -> keeltrust::Result<()> {
    let mut to_acceptor = vec![initiator.begin_key_exchange()?];
    let mut to_initiator: Vec<HandshakeStep> = Vec::new();

    while !to_acceptor.is_empty() || !to_initiator.is_empty() {
        for step in std::mem::take(&mut to_acceptor) {
            let payload = relay(initiator, acceptor, &step);
            to_initiator.extend(acceptor.process_peer_step(step.kind, &payload, acceptor_trust)?);
        }
        for step in std::mem::take(&mut to_initiator) {
            let payload = relay(acceptor, initiator, &step);
            to_acceptor.extend(initiator.process_peer_step(step.kind, &payload, initiator_trust)?);
        }
    }

    finish_rekey(initiator, acceptor, acceptor_trust);
    finish_rekey(acceptor, initiator, initiator_trust);
    Ok(())
}

// ── Persisted identities end to end ──────────────────────────────────────

#[test]
fn persisted_identities_survive_reconnect() {
    let server_dir = tempfile::tempdir().unwrap();
    let client_dir = tempfile::tempdir().unwrap();

    for _ in 0..2 {
        let server_id = IdentityKeyPair::load_or_create(server_dir.path(), "server.json").unwrap();
        let client_id = IdentityKeyPair::load_or_create(client_dir.path(), "client.json").unwrap();

        let client_trust = TrustStore::new(client_id.clone());
        let mut server_trust = TrustStore::new(server_id.clone());
        server_trust
            .add_peer(Peer::from_public_key("terminal", client_id.public_key()))
            .unwrap();

        let mut initiator = AeadSession::initiator(client_id, false);
        initiator.set_peer_identity(server_id.public_key());
        let mut acceptor = AeadSession::acceptor(server_id, false);

        run_handshake(&mut initiator, &mut acceptor, &client_trust, &server_trust).unwrap();

        assert_eq!(initiator.authentication_state(), InnerState::Authenticated);
        assert_eq!(acceptor.authentication_state(), InnerState::Authenticated);

        let sealed = initiator.seal(b"session traffic").unwrap();
        assert_eq!(acceptor.open(&sealed).unwrap(), b"session traffic");
    }

    // The same key material was reloaded, not regenerated.
    let a = IdentityKeyPair::load_or_create(server_dir.path(), "server.json").unwrap();
    let b = IdentityKeyPair::load_or_create(server_dir.path(), "server.json").unwrap();
    assert_eq!(a.public_key_hex(), b.public_key_hex());
}

// ── Trust gate flow ──────────────────────────────────────────────────────

#[test]
fn unknown_server_key_goes_through_a_decision_slot() {
    let server_id = IdentityKeyPair::generate();
    let client_trust = TrustStore::with_ephemeral_key();
    let server_trust = TrustStore::with_ephemeral_key();

    // The application thread approves the announced key while the
    // connection thread waits, the same split a transport uses.
    let decision = Arc::new(PendingDecision::new());
    let approver = {
        let decision = Arc::clone(&decision);
        std::thread::spawn(move || {
            decision.resolve(true);
        })
    };
    let accepted = decision.wait();
    approver.join().unwrap();
    assert!(accepted);

    // Approval pins the identity; the handshake then authenticates it.
    let mut initiator = AeadSession::initiator(IdentityKeyPair::generate(), true);
    initiator.set_peer_identity(server_id.public_key());
    let mut acceptor = AeadSession::acceptor(server_id.clone(), true);

    run_handshake(&mut initiator, &mut acceptor, &client_trust, &server_trust).unwrap();
    assert_eq!(initiator.peer_identity(), Some(server_id.public_key()));
}

#[test]
fn wrong_server_identity_fails_the_first_auth_round() {
    let real_server = IdentityKeyPair::generate();
    let impostor_pin = IdentityKeyPair::generate();
    let client_trust = TrustStore::with_ephemeral_key();
    let server_trust = TrustStore::with_ephemeral_key();

    let mut initiator = AeadSession::initiator(IdentityKeyPair::generate(), true);
    initiator.set_peer_identity(impostor_pin.public_key());
    let mut acceptor = AeadSession::acceptor(real_server, true);

    // Key exchange still succeeds, the identity check is the gate.
    let init = initiator.begin_key_exchange().unwrap();
    let replies = acceptor
        .process_peer_step(init.kind, &init.payload, &server_trust)
        .unwrap();

    let mut failed = false;
    for step in replies {
        let payload = relay(&mut acceptor, &mut initiator, &step);
        for next in initiator
            .process_peer_step(step.kind, &payload, &client_trust)
            .unwrap()
        {
            let payload = relay(&mut initiator, &mut acceptor, &next);
            // The challenge names the impostor, not the acceptor.
            if acceptor
                .process_peer_step(next.kind, &payload, &server_trust)
                .is_err()
            {
                failed = true;
            }
        }
    }
    assert!(failed);
    assert_eq!(acceptor.authentication_state(), InnerState::Failed);
}

// ── Bulk trust replacement ───────────────────────────────────────────────

#[test]
fn replaced_trust_set_drops_old_clients() {
    let server_id = IdentityKeyPair::generate();
    let old_client = IdentityKeyPair::generate();
    let new_client = IdentityKeyPair::generate();

    let mut server_trust = TrustStore::new(server_id.clone());
    server_trust
        .add_peer(Peer::from_public_key("old", old_client.public_key()))
        .unwrap();
    server_trust
        .replace_all_but_own([Peer::from_public_key("new", new_client.public_key())])
        .unwrap();

    // A handshake from the evicted client must not complete.
    let client_trust = TrustStore::with_ephemeral_key();
    let mut initiator = AeadSession::initiator(old_client, false);
    initiator.set_peer_identity(server_id.public_key());
    let mut acceptor = AeadSession::acceptor(server_id, false);

    assert!(
        run_handshake(&mut initiator, &mut acceptor, &client_trust, &server_trust).is_err()
    );
}
