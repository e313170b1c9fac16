//! Reading and writing key files.
//!
//! Key files hold either the raw 160-byte key pair used to encrypt stored
//! variables or a base64 Ed25519 identity. Both must only be readable by
//! their owner.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ed25519_dalek::{SigningKey, SECRET_KEY_LENGTH};
use thiserror::Error;
use tracing::debug;
use zeroize::Zeroizing;

use super::{CrypterError, KeyMaterial};

/// Key file errors
#[derive(Debug, Error)]
pub enum KeyFileError {
    #[error("Key file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Key file {path} has mode {mode:o}, expected 600 or 400")]
    InsecurePermissions { path: String, mode: u32 },

    #[error("Key file {path} does not hold a base64 Ed25519 key")]
    InvalidIdentity { path: String },

    #[error("Key file {path}: {source}")]
    Crypter {
        path: String,
        #[source]
        source: CrypterError,
    },
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> KeyFileError + '_ {
    move |source| KeyFileError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Read a file that must only be readable by its owner.
fn read_private_file(path: &Path) -> Result<Zeroizing<Vec<u8>>, KeyFileError> {
    let metadata = fs::metadata(path).map_err(io_error(path))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = metadata.permissions().mode() & 0o777;
        if mode != 0o600 && mode != 0o400 {
            return Err(KeyFileError::InsecurePermissions {
                path: path.display().to_string(),
                mode,
            });
        }
    }
    #[cfg(not(unix))]
    let _ = metadata;

    let bytes = Zeroizing::new(fs::read(path).map_err(io_error(path))?);
    debug!(path = %path.display(), "Read key file");
    Ok(bytes)
}

/// Replace a file with `bytes`, restricting it to its owner before any
/// byte is written.
fn write_private_file(path: &Path, bytes: &[u8]) -> Result<(), KeyFileError> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);

    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(path).map_err(io_error(path))?;

    // `mode` only applies to newly created files.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(fs::Permissions::from_mode(0o600))
            .map_err(io_error(path))?;
    }

    file.write_all(bytes).map_err(io_error(path))?;
    file.sync_all().map_err(io_error(path))?;
    debug!(path = %path.display(), "Wrote key file");
    Ok(())
}

/// Read key material, refusing files readable by group or others.
pub fn read_key_file(path: &Path) -> Result<KeyMaterial, KeyFileError> {
    let bytes = read_private_file(path)?;
    KeyMaterial::from_bytes(&bytes).map_err(|source| KeyFileError::Crypter {
        path: path.display().to_string(),
        source,
    })
}

/// Write key material, replacing any existing file.
pub fn write_key_file(path: &Path, key: &KeyMaterial) -> Result<(), KeyFileError> {
    write_private_file(path, &key.to_bytes())
}

/// Read an Ed25519 signing key stored as a base64 seed.
///
/// Used for the server host key and for caller identities.
pub fn read_identity(path: &Path) -> Result<SigningKey, KeyFileError> {
    let encoded = read_private_file(path)?;
    let invalid = || KeyFileError::InvalidIdentity {
        path: path.display().to_string(),
    };

    let text = std::str::from_utf8(&encoded).map_err(|_| invalid())?;
    let seed = Zeroizing::new(BASE64.decode(text.trim()).map_err(|_| invalid())?);
    let seed: &[u8; SECRET_KEY_LENGTH] = seed.as_slice().try_into().map_err(|_| invalid())?;
    Ok(SigningKey::from_bytes(seed))
}

/// Write an Ed25519 signing key as a base64 seed with owner-only mode.
pub fn write_identity(path: &Path, key: &SigningKey) -> Result<(), KeyFileError> {
    let mut encoded = Zeroizing::new(BASE64.encode(key.to_bytes()));
    encoded.push('\n');
    write_private_file(path, encoded.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("key");

        let key = KeyMaterial::generate().unwrap();
        write_key_file(&path, &key).unwrap();

        let loaded = read_key_file(&path).unwrap();
        assert_eq!(loaded.encryption_key(), key.encryption_key());
        assert_eq!(loaded.signing_key(), key.signing_key());
    }

    #[cfg(unix)]
    #[test]
    fn test_written_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("key");
        fs::write(&path, b"old contents").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();

        write_key_file(&path, &KeyMaterial::generate().unwrap()).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[cfg(unix)]
    #[test]
    fn test_insecure_permissions_refused() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("key");
        write_key_file(&path, &KeyMaterial::generate().unwrap()).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o640)).unwrap();

        assert!(matches!(
            read_key_file(&path),
            Err(KeyFileError::InsecurePermissions { mode: 0o640, .. })
        ));

        fs::set_permissions(&path, fs::Permissions::from_mode(0o400)).unwrap();
        assert!(read_key_file(&path).is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn test_wrong_length_refused() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("key");
        fs::write(&path, [0u8; 100]).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600)).unwrap();

        assert!(matches!(
            read_key_file(&path),
            Err(KeyFileError::Crypter {
                source: CrypterError::KeyLengthInvalid { .. },
                ..
            })
        ));
    }

    #[test]
    fn test_identity_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("id_ed25519");

        let key = SigningKey::generate(&mut rand::rngs::OsRng);
        write_identity(&path, &key).unwrap();

        let loaded = read_identity(&path).unwrap();
        assert_eq!(loaded.verifying_key(), key.verifying_key());
    }

    #[cfg(unix)]
    #[test]
    fn test_invalid_identity() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("id_ed25519");
        fs::write(&path, "not base64 at all").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600)).unwrap();
        assert!(matches!(
            read_identity(&path),
            Err(KeyFileError::InvalidIdentity { .. })
        ));

        fs::write(&path, BASE64.encode([1u8; 16])).unwrap();
        assert!(read_identity(&path).is_err());
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            read_key_file(&dir.path().join("absent")),
            Err(KeyFileError::Io { .. })
        ));
    }
}
