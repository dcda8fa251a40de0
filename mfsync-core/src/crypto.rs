//! Session crypto: X25519 agreement, HKDF-SHA256 session keys and
//! ChaCha20-Poly1305 wrapping of every message on the wire.
//!
//! A [`CryptoHandler`] owns the node keypair plus a table of per-peer
//! session keys. The long-lived handler kept by the process tracks one
//! entry per discovered peer; each connection derives a fresh handler
//! (fresh salt, fresh keys) so chunk counters never collide across
//! sessions. Keys are directional: the initiator and responder halves
//! of the HKDF output are assigned by [`Role`], and each direction
//! advances its own nonce counter.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chacha20poly1305::aead::{Aead, AeadInPlace, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce, Tag};
use hkdf::Hkdf;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::identity::Keypair;

/// Fixed HKDF info string; both sides must agree on it.
const KDF_INFO: &[u8] = b"KeyDerivation";
/// Per-connection salt length in bytes.
pub const SALT_LEN: usize = 128;
/// Poly1305 tag length appended to every chunk frame.
pub const TAG_LEN: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("peer key is not on the allow-list")]
    NotAllowed,
    #[error("no session key for peer")]
    UnknownPeer,
    #[error("invalid hex key material")]
    KeyDecode,
    #[error("authenticated decryption failed")]
    Aead,
}

/// Which end of the connection this handler sits on. Decides which half
/// of the derived key material encrypts outbound traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Opened the connection and sent the handshake.
    Initiator,
    /// Accepted the connection.
    Responder,
}

/// Self-describing unit of authenticated data on the wire. The counter
/// travels openly; only `cipher_text` is opaque.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptionWrapper {
    pub cipher_text: Vec<u8>,
    pub mac: [u8; 16],
    pub count: u64,
    pub aad: String,
}

/// One direction of a session: key plus the next nonce counter.
struct SequenceKey {
    key: [u8; 32],
    count: u64,
}

/// Directional key material for one peer.
struct SessionKeys {
    /// Encrypts what we send.
    local: SequenceKey,
    /// Decrypts what the peer sends.
    remote: SequenceKey,
}

/// Case-insensitive hex encoding used for keys and salts.
pub fn encode(bytes: &[u8]) -> String {
    hex::encode(bytes)
}

pub fn decode(value: &str) -> Result<Vec<u8>, CryptoError> {
    hex::decode(value.trim()).map_err(|_| CryptoError::KeyDecode)
}

/// Random per-connection salt, generated once by the connecting side.
pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    salt
}

/// 12-byte AEAD nonce: little-endian counter, zero padded.
fn nonce_from_count(count: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[..8].copy_from_slice(&count.to_le_bytes());
    nonce
}

pub struct CryptoHandler {
    keypair: Arc<Keypair>,
    allowed_keys: Vec<String>,
    sessions: Mutex<HashMap<String, SessionKeys>>,
}

impl CryptoHandler {
    pub fn new(keypair: Arc<Keypair>) -> Self {
        Self {
            keypair,
            allowed_keys: Vec::new(),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn public_key_hex(&self) -> String {
        self.keypair.public_key_hex()
    }

    /// Restrict accepted peers. An empty list trusts everyone.
    pub fn add_allowed_key(&mut self, pub_key: String) {
        self.allowed_keys.push(pub_key.to_lowercase());
    }

    pub fn is_allowed(&self, pub_key: &str) -> bool {
        self.allowed_keys.is_empty()
            || self
                .allowed_keys
                .iter()
                .any(|key| key.eq_ignore_ascii_case(pub_key))
    }

    /// Agree on session keys with `peer_pub_hex` using the given salt.
    /// Idempotent: a second call for an already-trusted peer succeeds
    /// without touching the stored keys.
    pub fn trust(&self, peer_pub_hex: &str, salt_hex: &str, role: Role) -> Result<(), CryptoError> {
        if !self.is_allowed(peer_pub_hex) {
            return Err(CryptoError::NotAllowed);
        }

        let mut sessions = self.sessions.lock().expect("crypto lock poisoned");
        if sessions.contains_key(peer_pub_hex) {
            return Ok(());
        }

        let peer_public: [u8; 32] = decode(peer_pub_hex)?
            .try_into()
            .map_err(|_| CryptoError::KeyDecode)?;
        let salt = decode(salt_hex)?;
        let shared = self.keypair.shared_secret(&peer_public);

        // One HKDF expansion, split into the two directional keys.
        let hkdf = Hkdf::<Sha256>::new(Some(&salt), &shared);
        let mut okm = [0u8; 64];
        hkdf.expand(KDF_INFO, &mut okm)
            .map_err(|_| CryptoError::KeyDecode)?;

        let (first, second) = okm.split_at(32);
        let first: [u8; 32] = first.try_into().expect("split at 32");
        let second: [u8; 32] = second.try_into().expect("split at 32");
        let (local, remote) = match role {
            Role::Initiator => (first, second),
            Role::Responder => (second, first),
        };

        sessions.insert(
            peer_pub_hex.to_string(),
            SessionKeys {
                local: SequenceKey {
                    key: local,
                    count: 0,
                },
                remote: SequenceKey {
                    key: remote,
                    count: 0,
                },
            },
        );
        Ok(())
    }

    /// Fresh per-connection handler: same identity and allow-list, but
    /// only the newly-agreed session key for `peer_pub_hex`.
    pub fn derive(
        &self,
        peer_pub_hex: &str,
        salt_hex: &str,
        role: Role,
    ) -> Result<CryptoHandler, CryptoError> {
        let handler = CryptoHandler {
            keypair: Arc::clone(&self.keypair),
            allowed_keys: self.allowed_keys.clone(),
            sessions: Mutex::new(HashMap::new()),
        };
        handler.trust(peer_pub_hex, salt_hex, role)?;
        Ok(handler)
    }

    /// Encrypt `plain` for `peer_pub_hex`, authenticating `aad`
    /// alongside. Consumes the next outbound counter.
    pub fn encrypt(
        &self,
        peer_pub_hex: &str,
        plain: &[u8],
        aad: &str,
    ) -> Result<EncryptionWrapper, CryptoError> {
        let mut sessions = self.sessions.lock().expect("crypto lock poisoned");
        let keys = sessions
            .get_mut(peer_pub_hex)
            .ok_or(CryptoError::UnknownPeer)?;

        let count = keys.local.count;
        keys.local.count += 1;

        let cipher = ChaCha20Poly1305::new(Key::from_slice(&keys.local.key));
        let mut cipher_text = plain.to_vec();
        let tag = cipher
            .encrypt_in_place_detached(
                Nonce::from_slice(&nonce_from_count(count)),
                aad.as_bytes(),
                &mut cipher_text,
            )
            .map_err(|_| CryptoError::Aead)?;

        Ok(EncryptionWrapper {
            cipher_text,
            mac: tag.into(),
            count,
            aad: aad.to_string(),
        })
    }

    /// Decrypt a wrapper from `peer_pub_hex`. The nonce comes from the
    /// wrapper's own counter; on success the inbound counter is synced
    /// to `count + 1` so subsequent chunk frames line up.
    pub fn decrypt(
        &self,
        peer_pub_hex: &str,
        wrapper: &EncryptionWrapper,
    ) -> Result<Vec<u8>, CryptoError> {
        let mut sessions = self.sessions.lock().expect("crypto lock poisoned");
        let keys = sessions
            .get_mut(peer_pub_hex)
            .ok_or(CryptoError::UnknownPeer)?;

        let cipher = ChaCha20Poly1305::new(Key::from_slice(&keys.remote.key));
        let mut plain = wrapper.cipher_text.clone();
        cipher
            .decrypt_in_place_detached(
                Nonce::from_slice(&nonce_from_count(wrapper.count)),
                wrapper.aad.as_bytes(),
                &mut plain,
                Tag::from_slice(&wrapper.mac),
            )
            .map_err(|_| CryptoError::Aead)?;

        keys.remote.count = wrapper.count + 1;
        Ok(plain)
    }

    /// Encrypt one file chunk as a raw frame: ciphertext with the tag
    /// appended, no wrapper. Counters advance lock-step on both ends.
    pub fn encrypt_chunk(&self, peer_pub_hex: &str, plain: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut sessions = self.sessions.lock().expect("crypto lock poisoned");
        let keys = sessions
            .get_mut(peer_pub_hex)
            .ok_or(CryptoError::UnknownPeer)?;

        let count = keys.local.count;
        keys.local.count += 1;

        let cipher = ChaCha20Poly1305::new(Key::from_slice(&keys.local.key));
        cipher
            .encrypt(
                Nonce::from_slice(&nonce_from_count(count)),
                Payload::from(plain),
            )
            .map_err(|_| CryptoError::Aead)
    }

    /// Decrypt one raw chunk frame using the lock-step inbound counter.
    pub fn decrypt_chunk(&self, peer_pub_hex: &str, frame: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut sessions = self.sessions.lock().expect("crypto lock poisoned");
        let keys = sessions
            .get_mut(peer_pub_hex)
            .ok_or(CryptoError::UnknownPeer)?;

        let count = keys.remote.count;
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&keys.remote.key));
        let plain = cipher
            .decrypt(
                Nonce::from_slice(&nonce_from_count(count)),
                Payload::from(frame),
            )
            .map_err(|_| CryptoError::Aead)?;

        keys.remote.count += 1;
        Ok(plain)
    }

    /// Resync the inbound counter to what the peer advertised. Used by
    /// the list-reply path only; chunk frames advance lock-step.
    pub fn set_counter(&self, peer_pub_hex: &str, count: u64) -> Result<(), CryptoError> {
        let mut sessions = self.sessions.lock().expect("crypto lock poisoned");
        let keys = sessions
            .get_mut(peer_pub_hex)
            .ok_or(CryptoError::UnknownPeer)?;
        keys.remote.count = count;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (CryptoHandler, CryptoHandler, String, String, String) {
        let a = CryptoHandler::new(Arc::new(Keypair::generate()));
        let b = CryptoHandler::new(Arc::new(Keypair::generate()));
        let a_pub = a.public_key_hex();
        let b_pub = b.public_key_hex();
        let salt = encode(&generate_salt());
        (a, b, a_pub, b_pub, salt)
    }

    #[test]
    fn wrapper_roundtrip_with_aad() {
        let (a, b, a_pub, b_pub, salt) = pair();
        a.trust(&b_pub, &salt, Role::Initiator).unwrap();
        b.trust(&a_pub, &salt, Role::Responder).unwrap();

        let wrapper = a.encrypt(&b_pub, b"attack at dawn", "metadata").unwrap();
        let plain = b.decrypt(&a_pub, &wrapper).unwrap();
        assert_eq!(plain, b"attack at dawn");
        assert_eq!(wrapper.aad, "metadata");
    }

    #[test]
    fn tampered_ciphertext_mac_and_aad_fail() {
        let (a, b, a_pub, b_pub, salt) = pair();
        a.trust(&b_pub, &salt, Role::Initiator).unwrap();
        b.trust(&a_pub, &salt, Role::Responder).unwrap();

        let wrapper = a.encrypt(&b_pub, b"payload bytes", "").unwrap();

        let mut bad = wrapper.clone();
        bad.cipher_text[0] ^= 0x01;
        assert!(matches!(b.decrypt(&a_pub, &bad), Err(CryptoError::Aead)));

        let mut bad = wrapper.clone();
        bad.mac[15] ^= 0x01;
        assert!(matches!(b.decrypt(&a_pub, &bad), Err(CryptoError::Aead)));

        let mut bad = wrapper.clone();
        bad.aad.push('x');
        assert!(matches!(b.decrypt(&a_pub, &bad), Err(CryptoError::Aead)));

        // The untouched wrapper still decrypts.
        assert!(b.decrypt(&a_pub, &wrapper).is_ok());
    }

    #[test]
    fn counters_strictly_increase() {
        let (a, _b, _a_pub, b_pub, salt) = pair();
        a.trust(&b_pub, &salt, Role::Initiator).unwrap();

        let first = a.encrypt(&b_pub, b"one", "").unwrap();
        let second = a.encrypt(&b_pub, b"one", "").unwrap();
        assert_eq!(first.count, 0);
        assert_eq!(second.count, 1);
        // Same plaintext, different nonce, different ciphertext.
        assert_ne!(first.cipher_text, second.cipher_text);
    }

    #[test]
    fn directions_use_distinct_keys() {
        let (a, b, a_pub, b_pub, salt) = pair();
        a.trust(&b_pub, &salt, Role::Initiator).unwrap();
        b.trust(&a_pub, &salt, Role::Responder).unwrap();

        // Both sides encrypt with counter 0. If the directions shared a
        // key this would be nonce reuse; distinct keys make the
        // ciphertexts unrelated and each side still decrypts the other.
        let from_a = a.encrypt(&b_pub, b"same text", "").unwrap();
        let from_b = b.encrypt(&a_pub, b"same text", "").unwrap();
        assert_ne!(from_a.cipher_text, from_b.cipher_text);
        assert_eq!(b.decrypt(&a_pub, &from_a).unwrap(), b"same text");
        assert_eq!(a.decrypt(&b_pub, &from_b).unwrap(), b"same text");
    }

    #[test]
    fn chunk_frames_advance_lock_step() {
        let (a, b, a_pub, b_pub, salt) = pair();
        a.trust(&b_pub, &salt, Role::Initiator).unwrap();
        b.trust(&a_pub, &salt, Role::Responder).unwrap();

        for chunk in [&b"first"[..], &b"second"[..], &b""[..]] {
            let frame = a.encrypt_chunk(&b_pub, chunk).unwrap();
            assert_eq!(frame.len(), chunk.len() + TAG_LEN);
            assert_eq!(b.decrypt_chunk(&a_pub, &frame).unwrap(), chunk);
        }
    }

    #[test]
    fn wrapper_decrypt_resyncs_chunk_counter() {
        let (a, b, a_pub, b_pub, salt) = pair();
        a.trust(&b_pub, &salt, Role::Initiator).unwrap();
        b.trust(&a_pub, &salt, Role::Responder).unwrap();

        // A confirmation wrapper followed by chunk frames, as in a
        // transfer session.
        let accepted = a.encrypt(&b_pub, b"accepted", "").unwrap();
        assert_eq!(b.decrypt(&a_pub, &accepted).unwrap(), b"accepted");
        let frame = a.encrypt_chunk(&b_pub, b"chunk data").unwrap();
        assert_eq!(b.decrypt_chunk(&a_pub, &frame).unwrap(), b"chunk data");
    }

    #[test]
    fn set_counter_resyncs_receiver() {
        let (a, b, a_pub, b_pub, salt) = pair();
        a.trust(&b_pub, &salt, Role::Initiator).unwrap();
        b.trust(&a_pub, &salt, Role::Responder).unwrap();

        // Burn a few outbound counters on the sender.
        for _ in 0..3 {
            a.encrypt_chunk(&b_pub, b"skipped").unwrap();
        }
        b.set_counter(&a_pub, 3).unwrap();
        let frame = a.encrypt_chunk(&b_pub, b"caught up").unwrap();
        assert_eq!(b.decrypt_chunk(&a_pub, &frame).unwrap(), b"caught up");
    }

    #[test]
    fn trust_is_idempotent_per_peer() {
        let (a, b, a_pub, b_pub, salt) = pair();
        a.trust(&b_pub, &salt, Role::Initiator).unwrap();
        b.trust(&a_pub, &salt, Role::Responder).unwrap();

        let wrapper = a.encrypt(&b_pub, b"before", "").unwrap();
        // A second trust with a different salt must not replace the key.
        let other_salt = encode(&generate_salt());
        a.trust(&b_pub, &other_salt, Role::Initiator).unwrap();
        let wrapper_after = a.encrypt(&b_pub, b"after", "").unwrap();
        assert_eq!(b.decrypt(&a_pub, &wrapper).unwrap(), b"before");
        assert_eq!(b.decrypt(&a_pub, &wrapper_after).unwrap(), b"after");
    }

    #[test]
    fn allow_list_rejects_unknown_key() {
        let (mut a, b, _a_pub, b_pub, salt) = pair();
        a.add_allowed_key("aa".repeat(32));
        assert!(matches!(
            a.trust(&b_pub, &salt, Role::Initiator),
            Err(CryptoError::NotAllowed)
        ));
        // Adding the real key lifts the rejection.
        a.add_allowed_key(b.public_key_hex());
        assert!(a.trust(&b_pub, &salt, Role::Initiator).is_ok());
    }

    #[test]
    fn salts_are_long_and_unique() {
        let first = generate_salt();
        let second = generate_salt();
        assert_eq!(first.len(), SALT_LEN);
        assert_ne!(first[..], second[..]);
    }

    #[test]
    fn hex_decode_is_case_insensitive() {
        let bytes = decode("DeadBeef").unwrap();
        assert_eq!(bytes, vec![0xde, 0xad, 0xbe, 0xef]);
        assert!(decode("not hex").is_err());
    }

    #[test]
    fn unknown_peer_is_an_error() {
        let (a, _b, _a_pub, b_pub, _salt) = pair();
        assert!(matches!(
            a.encrypt(&b_pub, b"x", ""),
            Err(CryptoError::UnknownPeer)
        ));
    }
}
