// Ephemeral ECDH keypairs for the outer key exchange.
//
// One keypair per direction per session. The shared secret never leaves this
// module in raw form except to feed the direction-key HKDF.

use rand::RngCore;
use secp256k1::ecdh::SharedSecret;
use secp256k1::{PublicKey, SecretKey, SECP256K1};
use zeroize::Zeroizing;

use crate::crypto::keys::COMPRESSED_KEY_LEN;
use crate::error::Result;

/// A single-use secp256k1 keypair for one key-exchange round.
pub struct EphemeralKeyPair {
    secret: SecretKey,
    public: PublicKey,
}

impl EphemeralKeyPair {
    /// Generate a fresh ephemeral keypair from the OS CSPRNG.
    pub fn generate() -> Self {
        loop {
            let mut buf = Zeroizing::new([0u8; 32]);
            rand::rngs::OsRng.fill_bytes(buf.as_mut());
            if let Ok(secret) = SecretKey::from_slice(buf.as_ref()) {
                let public = secret.public_key(SECP256K1);
                return Self { secret, public };
            }
        }
    }

    /// The public half in SEC1 compressed form.
    pub fn public_compressed(&self) -> [u8; COMPRESSED_KEY_LEN] {
        self.public.serialize()
    }

    /// Run ECDH against a validated peer public key.
    pub fn agree(&self, peer: &PublicKey) -> Result<[u8; 32]> {
        let shared = SharedSecret::new(peer, &self.secret);
        Ok(shared.secret_bytes())
    }
}
