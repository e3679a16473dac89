// Socket adapter seams: send hooks the transports write through, and the
// callback bundles applications observe the connection with.
//
// The transports own no sockets. The embedding I/O layer feeds raw bytes
// in through `on_raw_bytes`/`process_incoming` and hands wire-ready
// buffers out through these hooks.

use std::sync::Arc;

use keeltrust::{Peer, PendingDecision};

use crate::error::ErrorKind;

/// Client-side send hook: push one wire buffer toward the peer. Returns
/// false when the socket refused it.
pub type ClientSendFn = Box<dyn FnMut(&[u8]) -> bool + Send>;

/// Server-side send hook: push one wire buffer toward the named client.
pub type ServerSendFn = Box<dyn FnMut(&str, &[u8]) -> bool + Send>;

/// Unknown-key prompt: previous key fingerprint (if any), announced key
/// fingerprint, peer address, and the slot to resolve.
pub type NewPeerKeyFn =
    Box<dyn FnMut(Option<&str>, &str, &str, &Arc<PendingDecision>) + Send>;

/// Supplies the server's baseline trusted client set.
pub type TrustedClientsProvider = Box<dyn Fn() -> Vec<Peer> + Send>;

// ── Callback bundles ─────────────────────────────────────────────────────

/// Client transport callbacks. Every hook is optional; unset hooks are
/// skipped, except the new-key prompt whose absence means accept-and-warn,
/// a default only test setups should rely on.
#[derive(Default)]
pub struct ClientCallbacks {
    pub on_data: Option<Box<dyn FnMut(&[u8]) + Send>>,
    pub on_authenticated: Option<Box<dyn FnMut() + Send>>,
    pub on_disconnected: Option<Box<dyn FnMut() + Send>>,
    pub on_error: Option<Box<dyn FnMut(ErrorKind) + Send>>,
    pub on_new_peer_key: Option<NewPeerKeyFn>,
}

/// Server transport callbacks, keyed by client id.
#[derive(Default)]
pub struct ServerCallbacks {
    pub on_data: Option<Box<dyn FnMut(&str, &[u8]) + Send>>,
    pub on_client_authenticated: Option<Box<dyn FnMut(&str) + Send>>,
    pub on_client_disconnected: Option<Box<dyn FnMut(&str) + Send>>,
    pub on_client_error: Option<Box<dyn FnMut(&str, ErrorKind) + Send>>,
}
