//! Negotiable transport algorithms.

use std::fmt;
use std::str::FromStr;

use hmac::{Hmac, Mac};
use sha2::{Sha256, Sha512};

use super::TransportError;

/// Packet ciphers, all AEADs with a 32-byte key and 12-byte nonce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherAlgorithm {
    ChaCha20Poly1305,
    Aes256Gcm,
}

impl CipherAlgorithm {
    pub const ALL: [CipherAlgorithm; 2] = [Self::ChaCha20Poly1305, Self::Aes256Gcm];

    pub fn name(&self) -> &'static str {
        match self {
            Self::ChaCha20Poly1305 => "chacha20-poly1305",
            Self::Aes256Gcm => "aes256-gcm",
        }
    }
}

impl FromStr for CipherAlgorithm {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|alg| alg.name() == s)
            .ok_or_else(|| TransportError::UnsupportedAlgorithm(s.to_string()))
    }
}

impl fmt::Display for CipherAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// MACs used for the handshake finished tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacAlgorithm {
    HmacSha256,
    HmacSha512,
}

impl MacAlgorithm {
    pub const ALL: [MacAlgorithm; 2] = [Self::HmacSha512, Self::HmacSha256];

    pub fn name(&self) -> &'static str {
        match self {
            Self::HmacSha256 => "hmac-sha256",
            Self::HmacSha512 => "hmac-sha512",
        }
    }

    pub fn tag(&self, key: &[u8], data: &[u8]) -> Vec<u8> {
        match self {
            Self::HmacSha256 => {
                let mut mac = Hmac::<Sha256>::new_from_slice(key)
                    .expect("HMAC accepts keys of any length");
                mac.update(data);
                mac.finalize().into_bytes().to_vec()
            }
            Self::HmacSha512 => {
                let mut mac = Hmac::<Sha512>::new_from_slice(key)
                    .expect("HMAC accepts keys of any length");
                mac.update(data);
                mac.finalize().into_bytes().to_vec()
            }
        }
    }

    /// Constant-time tag comparison.
    pub fn verify(&self, key: &[u8], data: &[u8], tag: &[u8]) -> bool {
        match self {
            Self::HmacSha256 => {
                let mut mac = Hmac::<Sha256>::new_from_slice(key)
                    .expect("HMAC accepts keys of any length");
                mac.update(data);
                mac.verify_slice(tag).is_ok()
            }
            Self::HmacSha512 => {
                let mut mac = Hmac::<Sha512>::new_from_slice(key)
                    .expect("HMAC accepts keys of any length");
                mac.update(data);
                mac.verify_slice(tag).is_ok()
            }
        }
    }
}

impl FromStr for MacAlgorithm {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|alg| alg.name() == s)
            .ok_or_else(|| TransportError::UnsupportedAlgorithm(s.to_string()))
    }
}

impl fmt::Display for MacAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Parse a configured allow-list. Unknown names are an error.
pub fn parse_list<T>(names: &[String]) -> Result<Vec<T>, TransportError>
where
    T: FromStr<Err = TransportError>,
{
    names.iter().map(|name| name.parse()).collect()
}

/// Render a preference list as sent in `hello`.
pub fn join_names<T: fmt::Display>(algorithms: &[T]) -> String {
    algorithms
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

/// Parse a peer's comma-separated preference list, skipping names we do
/// not implement.
pub fn split_names<T: FromStr>(names: &str) -> Vec<T> {
    names
        .split(',')
        .filter_map(|name| name.trim().parse().ok())
        .collect()
}

/// First client preference the server allows.
pub fn negotiate<T: PartialEq + Copy>(client: &[T], server: &[T]) -> Option<T> {
    client.iter().copied().find(|alg| server.contains(alg))
}
