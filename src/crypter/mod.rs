//! Authenticated encryption for stored secrets.
//!
//! Values are encrypted with AES-256 in CBC mode and signed with
//! HMAC-SHA-512 before they are handed to a backend. The backend only ever
//! sees envelopes of the form `tag || iv || ciphertext`.
//!
//! ## Usage
//!
//! ```ignore
//! let key = KeyMaterial::generate()?;
//! let crypter = CrypterKind::Std.build(&key)?;
//!
//! let envelope = crypter.encrypt_and_sign(b"s3cr3t")?;
//! assert_eq!(crypter.validate_and_decrypt(&envelope)?, b"s3cr3t");
//! ```

pub mod aes_hmac;
pub mod key;
pub mod keyfile;

use std::str::FromStr;
use std::sync::Arc;

use thiserror::Error;

pub use aes_hmac::StdCrypter;
pub use key::KeyMaterial;
pub use keyfile::{read_identity, read_key_file, write_identity, write_key_file, KeyFileError};

/// Cipher engine errors
#[derive(Debug, Error)]
pub enum CrypterError {
    #[error("Invalid {which} key length: expected {expected} bytes, got {actual}")]
    KeyLengthInvalid {
        which: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("Envelope too short")]
    EnvelopeTooShort,

    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Malformed ciphertext")]
    MalformedCiphertext,

    #[error("Random source failed: {0}")]
    Random(rand::Error),

    #[error("Unknown crypter: {0}")]
    UnknownKind(String),
}

/// Result type for cipher engine operations
pub type CrypterResult<T> = Result<T, CrypterError>;

/// Encrypt-and-sign / validate-and-decrypt capability.
pub trait Crypter: Send + Sync {
    /// Encrypt `plaintext` and prepend an authentication tag.
    fn encrypt_and_sign(&self, plaintext: &[u8]) -> CrypterResult<Vec<u8>>;

    /// Authenticate `envelope` and, only if the tag matches, decrypt it.
    fn validate_and_decrypt(&self, envelope: &[u8]) -> CrypterResult<Vec<u8>>;
}

/// Shared crypter handle.
pub type SharedCrypter = Arc<dyn Crypter>;

/// Available crypter implementations, selected once from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CrypterKind {
    /// AES-256-CBC with HMAC-SHA-512.
    #[default]
    Std,
}

impl CrypterKind {
    /// Build a crypter of this kind from long-term key material.
    pub fn build(self, key: &KeyMaterial) -> CrypterResult<SharedCrypter> {
        match self {
            CrypterKind::Std => Ok(Arc::new(StdCrypter::new(
                key.encryption_key(),
                key.signing_key(),
            )?)),
        }
    }

    /// Generate fresh key material suitable for this kind.
    pub fn generate_key(self) -> CrypterResult<KeyMaterial> {
        match self {
            CrypterKind::Std => KeyMaterial::generate(),
        }
    }
}

impl FromStr for CrypterKind {
    type Err = CrypterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "std" => Ok(CrypterKind::Std),
            other => Err(CrypterError::UnknownKind(other.to_string())),
        }
    }
}

impl std::fmt::Display for CrypterKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CrypterKind::Std => f.write_str("std"),
        }
    }
}
