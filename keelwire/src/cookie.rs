// Cookie files: single-use key bootstrap between processes on one host.
//
// A cookie is exactly the 33-byte compressed public key, nothing else.
// Producers delete their cookie when dropped; consumers treat any missing,
// truncated or invalid file as a hard failure.

use std::fs;
use std::path::{Path, PathBuf};

use keeltrust::crypto::keys::COMPRESSED_KEY_LEN;
use keeltrust::{validate_identity_key, PublicKey};
use tracing::{debug, warn};

use crate::error::{KeelWireError, Result};

/// Writes our public key to a cookie file and removes it on drop.
pub struct CookieProducer {
    path: PathBuf,
}

impl CookieProducer {
    pub fn create(path: &Path, key: &PublicKey) -> Result<Self> {
        fs::write(path, key.serialize())?;
        debug!(path = %path.display(), "wrote identity cookie");
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for CookieProducer {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to remove cookie");
        }
    }
}

/// Read and validate a peer cookie. The file must hold exactly one
/// compressed key.
pub fn read_peer_cookie(path: &Path) -> Result<PublicKey> {
    let bytes = fs::read(path).map_err(|e| {
        KeelWireError::Cookie(format!("cannot read cookie {}: {e}", path.display()))
    })?;
    if bytes.len() != COMPRESSED_KEY_LEN {
        return Err(KeelWireError::Cookie(format!(
            "cookie {} must be exactly {} bytes, got {}",
            path.display(),
            COMPRESSED_KEY_LEN,
            bytes.len()
        )));
    }
    validate_identity_key(&bytes)
        .map_err(|e| KeelWireError::Cookie(format!("cookie {}: {e}", path.display())))
}
