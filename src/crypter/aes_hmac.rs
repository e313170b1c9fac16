//! AES-256-CBC + HMAC-SHA-512 crypter.

use aes::Aes256;
use cbc::cipher::generic_array::GenericArray;
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha512;
use zeroize::Zeroizing;

use super::key::{ENCRYPTION_KEY_LEN, SIGNING_KEY_LEN};
use super::{Crypter, CrypterError, CrypterResult};

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;
type HmacSha512 = Hmac<Sha512>;

/// AES block size, also the IV length.
pub const BLOCK_LEN: usize = 16;

/// HMAC-SHA-512 output length.
pub const TAG_LEN: usize = 64;

/// Crypter bound to one encryption key and one signing key.
///
/// Both keys are copied on construction, so later changes to the caller's
/// buffers cannot affect the crypter.
pub struct StdCrypter {
    encryption_key: Zeroizing<[u8; ENCRYPTION_KEY_LEN]>,
    signing_key: Zeroizing<[u8; SIGNING_KEY_LEN]>,
}

impl StdCrypter {
    /// Create a crypter, failing if either key has the wrong length.
    pub fn new(encryption_key: &[u8], signing_key: &[u8]) -> CrypterResult<Self> {
        let encryption_key: [u8; ENCRYPTION_KEY_LEN] =
            encryption_key
                .try_into()
                .map_err(|_| CrypterError::KeyLengthInvalid {
                    which: "encryption",
                    expected: ENCRYPTION_KEY_LEN,
                    actual: encryption_key.len(),
                })?;
        let signing_key: [u8; SIGNING_KEY_LEN] =
            signing_key
                .try_into()
                .map_err(|_| CrypterError::KeyLengthInvalid {
                    which: "signing",
                    expected: SIGNING_KEY_LEN,
                    actual: signing_key.len(),
                })?;

        Ok(Self {
            encryption_key: Zeroizing::new(encryption_key),
            signing_key: Zeroizing::new(signing_key),
        })
    }

    fn mac(&self) -> HmacSha512 {
        <HmacSha512 as Mac>::new_from_slice(&self.signing_key[..])
            .expect("HMAC accepts keys of any length")
    }
}

impl Crypter for StdCrypter {
    fn encrypt_and_sign(&self, plaintext: &[u8]) -> CrypterResult<Vec<u8>> {
        let mut iv = [0u8; BLOCK_LEN];
        OsRng.try_fill_bytes(&mut iv).map_err(CrypterError::Random)?;

        let ciphertext = Aes256CbcEnc::new(
            GenericArray::from_slice(&self.encryption_key[..]),
            GenericArray::from_slice(&iv),
        )
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext);

        let mut mac = self.mac();
        mac.update(&iv);
        mac.update(&ciphertext);
        let tag = mac.finalize().into_bytes();

        let mut envelope = Vec::with_capacity(TAG_LEN + BLOCK_LEN + ciphertext.len());
        envelope.extend_from_slice(&tag);
        envelope.extend_from_slice(&iv);
        envelope.extend_from_slice(&ciphertext);
        Ok(envelope)
    }

    fn validate_and_decrypt(&self, envelope: &[u8]) -> CrypterResult<Vec<u8>> {
        if envelope.len() < TAG_LEN + BLOCK_LEN {
            return Err(CrypterError::EnvelopeTooShort);
        }

        let (tag, signed) = envelope.split_at(TAG_LEN);

        // Constant-time comparison; nothing is decrypted before this passes.
        let mut mac = self.mac();
        mac.update(signed);
        mac.verify_slice(tag)
            .map_err(|_| CrypterError::InvalidSignature)?;

        let (iv, ciphertext) = signed.split_at(BLOCK_LEN);
        if ciphertext.is_empty() || ciphertext.len() % BLOCK_LEN != 0 {
            return Err(CrypterError::MalformedCiphertext);
        }

        Aes256CbcDec::new_from_slices(&self.encryption_key[..], iv)
            .map_err(|_| CrypterError::MalformedCiphertext)?
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| CrypterError::MalformedCiphertext)
    }
}
