//! KeelWire -- authenticated packet transport for the Keel stack.
//!
//! Sits between raw sockets and the application: length-prefixed packet
//! framing, the encrypted handshake driven by `keeltrust`, trust bootstrap
//! via cookie files, and connection upkeep (heartbeats, scheduled rekeys,
//! handshake timeouts). The transports own no sockets; the embedding I/O
//! layer feeds bytes in and a send hook carries wire buffers out.

pub mod adapter;
pub mod client;
pub mod config;
pub mod cookie;
pub mod error;
pub mod packet;
pub mod policy;
pub mod server;

// Re-export key public types at crate root.
pub use adapter::{
    ClientCallbacks, ClientSendFn, NewPeerKeyFn, ServerCallbacks, ServerSendFn,
    TrustedClientsProvider,
};
pub use client::ClientTransport;
pub use config::{AuthMode, CookieMode, KeyPersistence, TransportConfig};
pub use cookie::{read_peer_cookie, CookieProducer};
pub use error::{ErrorKind, KeelWireError, Result};
pub use packet::{FrameAccumulator, Packet, PacketClass, PacketType};
pub use policy::{HeartbeatAction, HeartbeatClock, RekeyClock};
pub use server::ServerTransport;
