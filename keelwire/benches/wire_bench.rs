// KeelWire transport-layer benchmarks using criterion.
//
// Measures:
//   - Packet build / parse throughput
//   - Frame accumulator reassembly
//   - Sealed frame build / open throughput over an established session
//   - Full transport handshake latency over in-memory queues

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use keeltrust::session::REKEY_NOTICE;
use keeltrust::{AeadSession, IdentityKeyPair, InnerState, StepKind, TrustStore};
use keelwire::packet::{build_sealed, open_sealed, FrameAccumulator, Packet, PacketType};
use keelwire::{
    ClientCallbacks, ClientSendFn, ClientTransport, ServerCallbacks, ServerSendFn,
    ServerTransport, TransportConfig,
};
use parking_lot::Mutex;

// ---------------------------------------------------------------------------
// Packet build throughput
// ---------------------------------------------------------------------------

fn bench_packet_build(c: &mut Criterion) {
    let sizes: &[usize] = &[64, 1024, 8192, 65536];

    let mut group = c.benchmark_group("packet_build");
    for &size in sizes {
        let packet = Packet::new(PacketType::SinglePacket, vec![0xABu8; size]);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{size}B")),
            &packet,
            |b, p| {
                b.iter(|| {
                    black_box(p.build());
                });
            },
        );
    }
    group.finish();
}

// ---------------------------------------------------------------------------
// Packet parse throughput
// ---------------------------------------------------------------------------

fn bench_packet_parse(c: &mut Criterion) {
    let sizes: &[usize] = &[64, 1024, 8192, 65536];

    let mut group = c.benchmark_group("packet_parse");
    for &size in sizes {
        let frame = Packet::new(PacketType::SinglePacket, vec![0xABu8; size]).build();
        group.throughput(Throughput::Bytes(frame.len() as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{size}B")),
            &frame,
            |b, data| {
                b.iter(|| {
                    black_box(Packet::parse(black_box(data)).unwrap());
                });
            },
        );
    }
    group.finish();
}

// ---------------------------------------------------------------------------
// Frame accumulator reassembly
// ---------------------------------------------------------------------------

fn bench_accumulator(c: &mut Criterion) {
    let frame = Packet::new(PacketType::SinglePacket, vec![0xABu8; 1024]).build();
    let mut burst = Vec::new();
    for _ in 0..16 {
        burst.extend_from_slice(&frame);
    }

    c.bench_function("accumulator_burst_16x1KiB", |b| {
        b.iter(|| {
            let mut acc = FrameAccumulator::new();
            acc.push(&burst);
            while let Some(frame) = acc.next_frame().unwrap() {
                black_box(frame);
            }
        });
    });

    c.bench_function("accumulator_byte_dribble", |b| {
        b.iter(|| {
            let mut acc = FrameAccumulator::new();
            for chunk in frame.chunks(7) {
                acc.push(chunk);
            }
            black_box(acc.next_frame().unwrap().unwrap());
        });
    });
}

// ---------------------------------------------------------------------------
// Sealed frame build / open
// ---------------------------------------------------------------------------

fn run_handshake(initiator: &mut AeadSession, acceptor: &mut AeadSession, trust: &TrustStore) {
    let mut to_acceptor = vec![initiator.begin_key_exchange().unwrap()];
    let mut to_initiator = Vec::new();

    while !to_acceptor.is_empty() || !to_initiator.is_empty() {
        for step in std::mem::take(&mut to_acceptor) {
            let payload = if step.kind.requires_sealing() {
                let sealed = initiator.seal(&step.payload).unwrap();
                acceptor.open(&sealed).unwrap()
            } else {
                step.payload.to_vec()
            };
            to_initiator.extend(acceptor.process_peer_step(step.kind, &payload, trust).unwrap());
        }
        for step in std::mem::take(&mut to_initiator) {
            let payload = if step.kind.requires_sealing() {
                let sealed = acceptor.seal(&step.payload).unwrap();
                initiator.open(&sealed).unwrap()
            } else {
                step.payload.to_vec()
            };
            to_acceptor.extend(initiator.process_peer_step(step.kind, &payload, trust).unwrap());
        }
    }

    finish_rekey(initiator, acceptor, trust);
    finish_rekey(acceptor, initiator, trust);
}

fn finish_rekey(from: &mut AeadSession, to: &mut AeadSession, trust: &TrustStore) {
    if from.authentication_state() == InnerState::Rekeyed {
        let sealed = from.seal(&REKEY_NOTICE).unwrap();
        from.rekey_outer_session().unwrap();
        let payload = to.open(&sealed).unwrap();
        to.process_peer_step(StepKind::Rekey, &payload, trust).unwrap();
    }
}

fn established_pair() -> (AeadSession, AeadSession) {
    let server = IdentityKeyPair::generate();
    let trust = TrustStore::with_ephemeral_key();

    let mut initiator = AeadSession::initiator(IdentityKeyPair::generate(), true);
    initiator.set_peer_identity(server.public_key());
    let mut acceptor = AeadSession::acceptor(server, true);

    run_handshake(&mut initiator, &mut acceptor, &trust);
    (initiator, acceptor)
}

fn bench_sealed_frames(c: &mut Criterion) {
    let sizes: &[usize] = &[64, 1024, 64 * 1024];

    let mut group = c.benchmark_group("sealed_roundtrip");
    for &size in sizes {
        let payload = Bytes::from(vec![0xABu8; size]);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{size}B")),
            &payload,
            |b, pt| {
                // Sender and receiver stay in counter lockstep inside each batch.
                let (mut tx, mut rx) = established_pair();
                b.iter(|| {
                    let wire =
                        build_sealed(PacketType::SinglePacket, pt.clone(), &mut tx).unwrap();
                    black_box(open_sealed(black_box(&wire), &mut rx).unwrap());
                });
            },
        );
    }
    group.finish();
}

// ---------------------------------------------------------------------------
// Full transport handshake latency
// ---------------------------------------------------------------------------

type Queue = Arc<Mutex<VecDeque<(String, Vec<u8>)>>>;

fn bench_transport_handshake(c: &mut Criterion) {
    c.bench_function("transport_handshake", |b| {
        b.iter(|| {
            let to_server: Queue = Arc::new(Mutex::new(VecDeque::new()));
            let to_client: Queue = Arc::new(Mutex::new(VecDeque::new()));

            let q = Arc::clone(&to_server);
            let client_hook: ClientSendFn = Box::new(move |buf| {
                q.lock().push_back(("cli".to_string(), buf.to_vec()));
                true
            });
            let q = Arc::clone(&to_client);
            let server_hook: ServerSendFn = Box::new(move |id, buf| {
                q.lock().push_back((id.to_string(), buf.to_vec()));
                true
            });

            let mut client = ClientTransport::new(
                TransportConfig::default(),
                ClientCallbacks::default(),
                client_hook,
            )
            .unwrap();
            let mut server = ServerTransport::new(
                TransportConfig::default(),
                ServerCallbacks::default(),
                server_hook,
                None,
            )
            .unwrap();

            client.open("srv").unwrap();
            server.add_client("cli").unwrap();
            loop {
                let msg = to_client.lock().pop_front();
                if let Some((_, bytes)) = msg {
                    client.on_raw_bytes(&bytes);
                    continue;
                }
                let msg = to_server.lock().pop_front();
                if let Some((id, bytes)) = msg {
                    server.process_incoming(&id, &bytes);
                    continue;
                }
                break;
            }

            assert!(client.is_authenticated());
            black_box(server.is_client_authenticated("cli"));
        });
    });
}

// ---------------------------------------------------------------------------
// Criterion harness
// ---------------------------------------------------------------------------

criterion_group! {
    name = wire_benches;
    config = Criterion::default()
        .sample_size(100)
        .measurement_time(Duration::from_secs(5));
    targets =
        bench_packet_build,
        bench_packet_parse,
        bench_accumulator,
        bench_sealed_frames,
        bench_transport_handshake
}

criterion_main!(wire_benches);
