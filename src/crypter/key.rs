//! Long-term key material for the cipher engine.

use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::{CrypterError, CrypterResult};

/// Length in bytes of the AES-256 encryption key.
pub const ENCRYPTION_KEY_LEN: usize = 32;

/// Length in bytes of the HMAC-SHA-512 signing key (one full SHA-512 block).
pub const SIGNING_KEY_LEN: usize = 128;

/// Length of the serialized key pair: `encryption_key || signing_key`.
pub const KEY_MATERIAL_LEN: usize = ENCRYPTION_KEY_LEN + SIGNING_KEY_LEN;

/// Encryption key plus signing key, generated together.
///
/// Both halves are wiped from memory when the value is dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct KeyMaterial {
    encryption_key: [u8; ENCRYPTION_KEY_LEN],
    signing_key: [u8; SIGNING_KEY_LEN],
}

impl KeyMaterial {
    /// Generate a fresh key pair from the OS random source.
    pub fn generate() -> CrypterResult<Self> {
        let mut key = Self {
            encryption_key: [0u8; ENCRYPTION_KEY_LEN],
            signing_key: [0u8; SIGNING_KEY_LEN],
        };
        OsRng
            .try_fill_bytes(&mut key.encryption_key)
            .map_err(CrypterError::Random)?;
        OsRng
            .try_fill_bytes(&mut key.signing_key)
            .map_err(CrypterError::Random)?;
        Ok(key)
    }

    /// Build key material from separate keys, checking both lengths.
    pub fn from_parts(encryption_key: &[u8], signing_key: &[u8]) -> CrypterResult<Self> {
        if encryption_key.len() != ENCRYPTION_KEY_LEN {
            return Err(CrypterError::KeyLengthInvalid {
                which: "encryption",
                expected: ENCRYPTION_KEY_LEN,
                actual: encryption_key.len(),
            });
        }
        if signing_key.len() != SIGNING_KEY_LEN {
            return Err(CrypterError::KeyLengthInvalid {
                which: "signing",
                expected: SIGNING_KEY_LEN,
                actual: signing_key.len(),
            });
        }

        let mut key = Self {
            encryption_key: [0u8; ENCRYPTION_KEY_LEN],
            signing_key: [0u8; SIGNING_KEY_LEN],
        };
        key.encryption_key.copy_from_slice(encryption_key);
        key.signing_key.copy_from_slice(signing_key);
        Ok(key)
    }

    /// Parse the serialized `encryption_key || signing_key` layout.
    pub fn from_bytes(bytes: &[u8]) -> CrypterResult<Self> {
        if bytes.len() != KEY_MATERIAL_LEN {
            return Err(CrypterError::KeyLengthInvalid {
                which: "key file",
                expected: KEY_MATERIAL_LEN,
                actual: bytes.len(),
            });
        }
        let (encryption_key, signing_key) = bytes.split_at(ENCRYPTION_KEY_LEN);
        Self::from_parts(encryption_key, signing_key)
    }

    /// Serialize as `encryption_key || signing_key`.
    pub fn to_bytes(&self) -> zeroize::Zeroizing<Vec<u8>> {
        let mut bytes = zeroize::Zeroizing::new(Vec::with_capacity(KEY_MATERIAL_LEN));
        bytes.extend_from_slice(&self.encryption_key);
        bytes.extend_from_slice(&self.signing_key);
        bytes
    }

    pub fn encryption_key(&self) -> &[u8; ENCRYPTION_KEY_LEN] {
        &self.encryption_key
    }

    pub fn signing_key(&self) -> &[u8; SIGNING_KEY_LEN] {
        &self.signing_key
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterial").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_keys_are_unique() {
        let a = KeyMaterial::generate().unwrap();
        let b = KeyMaterial::generate().unwrap();
        assert_ne!(a.encryption_key(), b.encryption_key());
        assert_ne!(a.signing_key(), b.signing_key());
    }

    #[test]
    fn test_from_parts_checks_lengths() {
        let err = KeyMaterial::from_parts(&[0u8; 16], &[0u8; SIGNING_KEY_LEN]).unwrap_err();
        assert!(matches!(
            err,
            CrypterError::KeyLengthInvalid {
                which: "encryption",
                expected: 32,
                actual: 16
            }
        ));

        let err = KeyMaterial::from_parts(&[0u8; ENCRYPTION_KEY_LEN], &[0u8; 64]).unwrap_err();
        assert!(matches!(err, CrypterError::KeyLengthInvalid { which: "signing", .. }));
    }

    #[test]
    fn test_serialized_layout() {
        let key = KeyMaterial::generate().unwrap();
        let bytes = key.to_bytes();
        assert_eq!(bytes.len(), KEY_MATERIAL_LEN);
        assert_eq!(&bytes[..ENCRYPTION_KEY_LEN], key.encryption_key());

        let parsed = KeyMaterial::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.signing_key(), key.signing_key());
    }

    #[test]
    fn test_debug_hides_keys() {
        let key = KeyMaterial::generate().unwrap();
        assert_eq!(format!("{:?}", key), "KeyMaterial { .. }");
    }
}
