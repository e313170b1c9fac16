//! Cryptographic primitives for the secure transport.
//!
//! Uses:
//! - X25519 for ephemeral key exchange
//! - Ed25519 for host and caller signatures
//! - HKDF-SHA-256 to derive per-direction keys from the shared secret
//! - ChaCha20-Poly1305 or AES-256-GCM for packet protection

use aes_gcm::Aes256Gcm;
use chacha20poly1305::{
    aead::{generic_array::GenericArray, Aead, KeyInit},
    ChaCha20Poly1305,
};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use x25519_dalek::{EphemeralSecret, PublicKey};
use zeroize::Zeroizing;

use super::{CipherAlgorithm, TransportError, TransportResult};

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

/// Authentication tag appended by both packet ciphers.
pub const TAG_LEN: usize = 16;

/// Ephemeral X25519 keypair for one handshake.
pub struct EphemeralKeyPair {
    secret: EphemeralSecret,
    public: PublicKey,
}

impl EphemeralKeyPair {
    pub fn generate() -> Self {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.public.to_bytes()
    }

    /// Perform Diffie-Hellman with the peer's key, refusing low-order points.
    pub fn diffie_hellman(self, their_public: &[u8]) -> TransportResult<Zeroizing<[u8; 32]>> {
        let their_public = parse_x25519_public_key(their_public)?;
        let shared = self.secret.diffie_hellman(&their_public);
        if !shared.was_contributory() {
            return Err(TransportError::HandshakeFailed(
                "non-contributory key exchange".to_string(),
            ));
        }
        Ok(Zeroizing::new(shared.to_bytes()))
    }
}

fn parse_x25519_public_key(bytes: &[u8]) -> TransportResult<PublicKey> {
    let arr: [u8; 32] = bytes
        .try_into()
        .map_err(|_| TransportError::Crypto("invalid ephemeral key".to_string()))?;
    Ok(PublicKey::from(arr))
}

/// Parse an Ed25519 verifying key from raw bytes.
pub fn parse_ed25519_public_key(bytes: &[u8]) -> TransportResult<VerifyingKey> {
    let arr: [u8; 32] = bytes
        .try_into()
        .map_err(|_| TransportError::Crypto("invalid public key".to_string()))?;
    VerifyingKey::from_bytes(&arr).map_err(|_| TransportError::Crypto("invalid public key".to_string()))
}

/// Verify an Ed25519 signature given as raw bytes.
pub fn verify_signature(key: &VerifyingKey, message: &[u8], signature: &[u8]) -> TransportResult<()> {
    let signature = Signature::from_slice(signature)
        .map_err(|_| TransportError::Crypto("invalid signature".to_string()))?;
    key.verify(message, &signature)
        .map_err(|_| TransportError::Crypto("signature verification failed".to_string()))
}

/// Running SHA-256 over the handshake messages.
#[derive(Clone, Default)]
pub struct Transcript(Sha256);

impl Transcript {
    pub fn new() -> Self {
        Self(Sha256::new())
    }

    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    pub fn finish(self) -> [u8; 32] {
        self.0.finalize().into()
    }
}

/// Message the caller signs to prove possession of its key.
pub fn auth_signature_message(transcript_hash: &[u8], principal: &str) -> Vec<u8> {
    let mut message = Vec::with_capacity(transcript_hash.len() + principal.len());
    message.extend_from_slice(transcript_hash);
    message.extend_from_slice(principal.as_bytes());
    message
}

/// Keys derived from one handshake.
pub struct SessionKeys {
    pub client_packet: Zeroizing<[u8; KEY_LEN]>,
    pub server_packet: Zeroizing<[u8; KEY_LEN]>,
    pub client_finished: Zeroizing<[u8; KEY_LEN]>,
    pub server_finished: Zeroizing<[u8; KEY_LEN]>,
}

impl SessionKeys {
    /// HKDF-SHA-256 with the transcript hash as salt.
    pub fn derive(shared_secret: &[u8], transcript_hash: &[u8]) -> Self {
        let hkdf = Hkdf::<Sha256>::new(Some(transcript_hash), shared_secret);
        let expand = |label: &[u8]| {
            let mut key = Zeroizing::new([0u8; KEY_LEN]);
            hkdf.expand(label, &mut key[..])
                .expect("32 bytes is a valid HKDF-SHA-256 output length");
            key
        };

        Self {
            client_packet: expand(b"stockroom c2s packet"),
            server_packet: expand(b"stockroom s2c packet"),
            client_finished: expand(b"stockroom c2s finished"),
            server_finished: expand(b"stockroom s2c finished"),
        }
    }
}

enum PacketCipher {
    ChaCha20Poly1305(Box<ChaCha20Poly1305>),
    Aes256Gcm(Box<Aes256Gcm>),
}

/// AEAD state for one direction of a connection.
///
/// Every packet consumes one sequence number, so replayed, dropped or
/// reordered packets fail authentication.
pub struct PacketProtection {
    cipher: PacketCipher,
    sequence: u64,
}

impl PacketProtection {
    pub fn new(algorithm: CipherAlgorithm, key: &[u8; KEY_LEN]) -> Self {
        let key = GenericArray::from_slice(&key[..]);
        let cipher = match algorithm {
            CipherAlgorithm::ChaCha20Poly1305 => {
                PacketCipher::ChaCha20Poly1305(Box::new(ChaCha20Poly1305::new(key)))
            }
            CipherAlgorithm::Aes256Gcm => PacketCipher::Aes256Gcm(Box::new(Aes256Gcm::new(key))),
        };
        Self {
            cipher,
            sequence: 0,
        }
    }

    fn next_nonce(&mut self) -> TransportResult<[u8; NONCE_LEN]> {
        let mut nonce = [0u8; NONCE_LEN];
        nonce[4..].copy_from_slice(&self.sequence.to_be_bytes());
        self.sequence = self
            .sequence
            .checked_add(1)
            .ok_or_else(|| TransportError::Crypto("packet sequence exhausted".to_string()))?;
        Ok(nonce)
    }

    pub fn seal(&mut self, plaintext: &[u8]) -> TransportResult<Vec<u8>> {
        let nonce = self.next_nonce()?;
        let nonce = GenericArray::from_slice(&nonce);
        let sealed = match &self.cipher {
            PacketCipher::ChaCha20Poly1305(cipher) => cipher.encrypt(nonce, plaintext),
            PacketCipher::Aes256Gcm(cipher) => cipher.encrypt(nonce, plaintext),
        };
        sealed.map_err(|_| TransportError::Crypto("encryption failed".to_string()))
    }

    pub fn open(&mut self, ciphertext: &[u8]) -> TransportResult<Vec<u8>> {
        let nonce = self.next_nonce()?;
        let nonce = GenericArray::from_slice(&nonce);
        let opened = match &self.cipher {
            PacketCipher::ChaCha20Poly1305(cipher) => cipher.decrypt(nonce, ciphertext),
            PacketCipher::Aes256Gcm(cipher) => cipher.decrypt(nonce, ciphertext),
        };
        opened.map_err(|_| TransportError::Crypto("decryption failed".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};

    #[test]
    fn test_key_exchange_agrees() {
        let client = EphemeralKeyPair::generate();
        let server = EphemeralKeyPair::generate();
        let client_public = client.public_key_bytes();
        let server_public = server.public_key_bytes();

        let client_secret = client.diffie_hellman(&server_public).unwrap();
        let server_secret = server.diffie_hellman(&client_public).unwrap();
        assert_eq!(*client_secret, *server_secret);
    }

    #[test]
    fn test_low_order_point_rejected() {
        let client = EphemeralKeyPair::generate();
        assert!(matches!(
            client.diffie_hellman(&[0u8; 32]),
            Err(TransportError::HandshakeFailed(_))
        ));
    }

    #[test]
    fn test_derived_keys_are_distinct() {
        let keys = SessionKeys::derive(&[7u8; 32], &[1u8; 32]);
        assert_ne!(*keys.client_packet, *keys.server_packet);
        assert_ne!(*keys.client_finished, *keys.server_finished);
        assert_ne!(*keys.client_packet, *keys.client_finished);

        let other = SessionKeys::derive(&[7u8; 32], &[2u8; 32]);
        assert_ne!(*keys.client_packet, *other.client_packet);
    }

    #[test]
    fn test_packet_protection_round_trip() {
        for alg in CipherAlgorithm::ALL {
            let key = [9u8; 32];
            let mut sender = PacketProtection::new(alg, &key);
            let mut receiver = PacketProtection::new(alg, &key);

            for message in [&b"first"[..], b"", b"third packet"] {
                let sealed = sender.seal(message).unwrap();
                assert_eq!(receiver.open(&sealed).unwrap(), message);
            }
        }
    }

    #[test]
    fn test_replayed_packet_rejected() {
        let key = [3u8; 32];
        let mut sender = PacketProtection::new(CipherAlgorithm::ChaCha20Poly1305, &key);
        let mut receiver = PacketProtection::new(CipherAlgorithm::ChaCha20Poly1305, &key);

        let sealed = sender.seal(b"once").unwrap();
        receiver.open(&sealed).unwrap();
        assert!(receiver.open(&sealed).is_err());
    }

    #[test]
    fn test_tampered_packet_rejected() {
        let key = [3u8; 32];
        let mut sender = PacketProtection::new(CipherAlgorithm::Aes256Gcm, &key);
        let mut receiver = PacketProtection::new(CipherAlgorithm::Aes256Gcm, &key);

        let mut sealed = sender.seal(b"payload").unwrap();
        sealed[0] ^= 0x01;
        assert!(receiver.open(&sealed).is_err());
    }

    #[test]
    fn test_signature_helpers() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let verifying_key =
            parse_ed25519_public_key(signing_key.verifying_key().as_bytes()).unwrap();

        let message = auth_signature_message(&[5u8; 32], "stockroom");
        let signature = signing_key.sign(&message);
        verify_signature(&verifying_key, &message, &signature.to_bytes()).unwrap();

        let other = auth_signature_message(&[5u8; 32], "someone-else");
        assert!(verify_signature(&verifying_key, &other, &signature.to_bytes()).is_err());
        assert!(verify_signature(&verifying_key, &message, &[0u8; 10]).is_err());
    }
}
