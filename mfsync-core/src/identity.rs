//! Node identity: a long-term X25519 keypair persisted next to the
//! storage root. The hex-encoded public half is what peers see in
//! beacons and handshakes.

use std::io;
use std::path::Path;

use rand::rngs::OsRng;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

/// Long-term X25519 keypair. The secret never leaves this struct;
/// sessions only consume the Diffie-Hellman result.
pub struct Keypair {
    secret: StaticSecret,
    public: X25519PublicKey,
}

impl Keypair {
    /// Generate a new random keypair.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = X25519PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Load the keypair from `path`, or generate one and persist it on
    /// first run. The file holds the raw 32 secret bytes.
    pub fn load_or_generate(path: &Path) -> io::Result<Self> {
        if path.exists() {
            let bytes = std::fs::read(path)?;
            let bytes: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("key file {} is not a 32-byte x25519 secret", path.display()),
                )
            })?;
            let secret = StaticSecret::from(bytes);
            let public = X25519PublicKey::from(&secret);
            Ok(Self { secret, public })
        } else {
            let keypair = Self::generate();
            std::fs::write(path, keypair.secret.to_bytes())?;
            Ok(keypair)
        }
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.public.to_bytes()
    }

    /// Hex-encoded public key, the node identity on the wire.
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public.to_bytes())
    }

    /// Raw ECDH agreement with a peer's public key. Session keys are
    /// derived from this via HKDF, never used directly.
    pub fn shared_secret(&self, peer_public: &[u8; 32]) -> [u8; 32] {
        let peer = X25519PublicKey::from(*peer_public);
        self.secret.diffie_hellman(&peer).to_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_exchange_symmetric() {
        let a = Keypair::generate();
        let b = Keypair::generate();
        assert_eq!(
            a.shared_secret(&b.public_key()),
            b.shared_secret(&a.public_key())
        );
    }

    #[test]
    fn persisted_key_reloads_identical() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("key.bin");
        let first = Keypair::load_or_generate(&path).unwrap();
        let second = Keypair::load_or_generate(&path).unwrap();
        assert_eq!(first.public_key_hex(), second.public_key_hex());
    }

    #[test]
    fn rejects_truncated_key_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("key.bin");
        std::fs::write(&path, [0u8; 7]).unwrap();
        assert!(Keypair::load_or_generate(&path).is_err());
    }
}
