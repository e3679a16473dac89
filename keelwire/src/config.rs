// Transport configuration: auth mode, key persistence, cookie mode and the
// timing defaults.

use std::path::PathBuf;
use std::time::Duration;

/// Default heartbeat cadence for remote peers.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
/// Heartbeat cadence preset for same-host peers.
pub const LOCAL_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(3);
/// How long a connection may sit in the handshake before it times out.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
/// Scheduled rekey interval.
pub const DEFAULT_REKEY_INTERVAL: Duration = Duration::from_secs(600);
/// Sealed-byte volume that forces a rekey.
pub const DEFAULT_REKEY_BYTE_LIMIT: u64 = 1 << 30;

/// Whether clients must prove an identity or only the server does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    /// Server authenticates to the client; clients stay anonymous.
    OneWay,
    /// Both endpoints authenticate.
    TwoWay,
}

/// Where the endpoint's identity keypair lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyPersistence {
    /// Fresh keypair per process, nothing written to disk.
    Ephemeral,
    /// Keyfile under `dir/name`, created on first use.
    Persistent { dir: PathBuf, name: String },
}

/// Out-of-band key bootstrap through a cookie file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CookieMode {
    Disabled,
    /// Write our public key to the path; the file is removed on drop.
    Produce(PathBuf),
    /// Read and pin the peer's public key from the path before connecting.
    Consume(PathBuf),
}

/// Per-transport settings.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub auth_mode: AuthMode,
    pub key_persistence: KeyPersistence,
    pub cookie: CookieMode,
    pub heartbeat_interval: Duration,
    pub handshake_timeout: Duration,
    pub rekey_interval: Duration,
    pub rekey_byte_limit: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            auth_mode: AuthMode::OneWay,
            key_persistence: KeyPersistence::Ephemeral,
            cookie: CookieMode::Disabled,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            rekey_interval: DEFAULT_REKEY_INTERVAL,
            rekey_byte_limit: DEFAULT_REKEY_BYTE_LIMIT,
        }
    }
}

impl TransportConfig {
    /// Preset for peers on the same host: tight heartbeats, everything else
    /// at the defaults.
    pub fn for_local_peer() -> Self {
        Self {
            heartbeat_interval: LOCAL_HEARTBEAT_INTERVAL,
            ..Self::default()
        }
    }
}
