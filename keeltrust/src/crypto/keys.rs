// Identity keys: long-lived secp256k1 keypairs that name an endpoint.
//
// Peers are identified by SEC1-encoded curve points, 33 bytes compressed or
// 65 bytes uncompressed. Signatures are 64-byte compact ECDSA over a 32-byte
// digest computed by the caller.

use std::fs;
use std::path::{Path, PathBuf};

use rand::RngCore;
use secp256k1::ecdsa::Signature;
use secp256k1::{Message, PublicKey, SecretKey, SECP256K1};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::error::{KeelTrustError, Result};

/// SEC1 compressed public key length.
pub const COMPRESSED_KEY_LEN: usize = 33;
/// SEC1 uncompressed public key length.
pub const UNCOMPRESSED_KEY_LEN: usize = 65;
/// Compact ECDSA signature length.
pub const SIGNATURE_LEN: usize = 64;

/// Validate raw identity key bytes: length must be exactly 33 or 65, and the
/// bytes must decode to a point on the curve. Returns the parsed key.
pub fn validate_identity_key(bytes: &[u8]) -> Result<PublicKey> {
    if bytes.len() != COMPRESSED_KEY_LEN && bytes.len() != UNCOMPRESSED_KEY_LEN {
        return Err(KeelTrustError::InvalidKey(format!(
            "public key must be {} or {} bytes, got {}",
            COMPRESSED_KEY_LEN,
            UNCOMPRESSED_KEY_LEN,
            bytes.len()
        )));
    }
    PublicKey::from_slice(bytes)
        .map_err(|e| KeelTrustError::InvalidKey(format!("not a curve point: {e}")))
}

/// Verify a 64-byte compact ECDSA signature over a 32-byte digest.
pub fn verify_digest(key: &PublicKey, digest: &[u8; 32], signature: &[u8]) -> Result<()> {
    let sig = Signature::from_compact(signature)
        .map_err(|_| KeelTrustError::SignatureVerification)?;
    let msg = Message::from_digest(*digest);
    SECP256K1
        .verify_ecdsa(&msg, &sig, key)
        .map_err(|_| KeelTrustError::SignatureVerification)
}

// ── Identity keypair ─────────────────────────────────────────────────────

/// On-disk keyfile format: the secret scalar, hex encoded.
#[derive(Serialize, Deserialize)]
struct KeyFile {
    secret: String,
}

/// A long-lived secp256k1 identity keypair.
#[derive(Clone)]
pub struct IdentityKeyPair {
    secret: SecretKey,
    public: PublicKey,
}

impl IdentityKeyPair {
    /// Generate a new random keypair using the OS CSPRNG.
    pub fn generate() -> Self {
        // Rejection-sample until the scalar is in range; the miss probability
        // is negligible but nonzero.
        loop {
            let mut buf = Zeroizing::new([0u8; 32]);
            rand::rngs::OsRng.fill_bytes(buf.as_mut());
            if let Ok(secret) = SecretKey::from_slice(buf.as_ref()) {
                let public = secret.public_key(SECP256K1);
                return Self { secret, public };
            }
        }
    }

    /// Create from raw secret scalar bytes.
    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Result<Self> {
        let secret = SecretKey::from_slice(bytes)
            .map_err(|e| KeelTrustError::InvalidKey(format!("bad secret scalar: {e}")))?;
        let public = secret.public_key(SECP256K1);
        Ok(Self { secret, public })
    }

    /// The public key.
    pub fn public_key(&self) -> PublicKey {
        self.public
    }

    /// The public key in SEC1 compressed form.
    pub fn public_key_compressed(&self) -> [u8; COMPRESSED_KEY_LEN] {
        self.public.serialize()
    }

    /// Hex fingerprint of the compressed public key.
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public.serialize())
    }

    /// Sign a 32-byte digest, returning the compact 64-byte signature.
    pub fn sign_digest(&self, digest: &[u8; 32]) -> [u8; SIGNATURE_LEN] {
        let msg = Message::from_digest(*digest);
        SECP256K1.sign_ecdsa(&msg, &self.secret).serialize_compact()
    }

    // ── Keyfile persistence ──────────────────────────────────────────────

    /// Write the keypair to a JSON keyfile with restrictive permissions
    /// (0600 on Unix).
    pub fn save(&self, path: &Path) -> Result<()> {
        let file = KeyFile {
            secret: hex::encode(self.secret.secret_bytes()),
        };
        let json = serde_json::to_string_pretty(&file)?;
        fs::write(path, json)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(path)?.permissions();
            perms.set_mode(0o600);
            fs::set_permissions(path, perms)?;
        }

        Ok(())
    }

    /// Load a keypair from a JSON keyfile.
    pub fn load(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path)?;
        let file: KeyFile = serde_json::from_str(&json)?;
        let raw = Zeroizing::new(
            hex::decode(&file.secret)
                .map_err(|e| KeelTrustError::InvalidKey(format!("bad secret hex: {e}")))?,
        );
        let bytes: &[u8; 32] = raw
            .as_slice()
            .try_into()
            .map_err(|_| KeelTrustError::InvalidKey("secret must be 32 bytes".into()))?;
        Self::from_secret_bytes(bytes)
    }

    /// Load the keyfile `<dir>/<name>` if it exists, otherwise generate a new
    /// keypair and persist it there.
    pub fn load_or_create(dir: &Path, name: &str) -> Result<Self> {
        let path: PathBuf = dir.join(name);
        if path.exists() {
            return Self::load(&path);
        }
        fs::create_dir_all(dir)?;
        let pair = Self::generate();
        pair.save(&path)?;
        Ok(pair)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_and_sign_verify() {
        let pair = IdentityKeyPair::generate();
        let digest = [0x42u8; 32];
        let sig = pair.sign_digest(&digest);
        verify_digest(&pair.public_key(), &digest, &sig).unwrap();
    }

    #[test]
    fn verify_rejects_wrong_digest() {
        let pair = IdentityKeyPair::generate();
        let sig = pair.sign_digest(&[0x42u8; 32]);
        let err = verify_digest(&pair.public_key(), &[0x43u8; 32], &sig).unwrap_err();
        assert!(matches!(err, KeelTrustError::SignatureVerification));
    }

    #[test]
    fn verify_rejects_wrong_key() {
        let pair = IdentityKeyPair::generate();
        let other = IdentityKeyPair::generate();
        let digest = [0x42u8; 32];
        let sig = pair.sign_digest(&digest);
        let err = verify_digest(&other.public_key(), &digest, &sig).unwrap_err();
        assert!(matches!(err, KeelTrustError::SignatureVerification));
    }

    #[test]
    fn validate_accepts_both_encodings() {
        let pair = IdentityKeyPair::generate();
        let compressed = pair.public_key_compressed();
        let uncompressed = pair.public_key().serialize_uncompressed();
        validate_identity_key(&compressed).unwrap();
        validate_identity_key(&uncompressed).unwrap();
    }

    #[test]
    fn validate_rejects_bad_lengths() {
        assert!(validate_identity_key(&[0u8; 32]).is_err());
        assert!(validate_identity_key(&[0u8; 34]).is_err());
        assert!(validate_identity_key(&[]).is_err());
    }

    #[test]
    fn validate_rejects_off_curve_point() {
        // Valid length, invalid prefix byte.
        let mut bytes = [0u8; COMPRESSED_KEY_LEN];
        bytes[0] = 0x05;
        assert!(validate_identity_key(&bytes).is_err());
    }

    #[test]
    fn keyfile_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let pair = IdentityKeyPair::generate();
        let path = dir.path().join("id_key.json");
        pair.save(&path).unwrap();

        let loaded = IdentityKeyPair::load(&path).unwrap();
        assert_eq!(loaded.public_key_compressed(), pair.public_key_compressed());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn load_or_create_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let first = IdentityKeyPair::load_or_create(dir.path(), "server_key").unwrap();
        let second = IdentityKeyPair::load_or_create(dir.path(), "server_key").unwrap();
        assert_eq!(first.public_key_hex(), second.public_key_hex());
    }
}
