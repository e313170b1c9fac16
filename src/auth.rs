//! Authorization layer.
//!
//! Maps a caller's public key and network origin to the set of commands
//! the caller may run. Evaluated once per connection; an empty result
//! refuses the connection.

use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ed25519_dalek::VerifyingKey;
use thiserror::Error;
use tracing::debug;

/// Authorization errors
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Unauthorized")]
    Unauthorized,

    #[error("Invalid public key for command {command}: {reason}")]
    InvalidPublicKey { command: String, reason: String },
}

/// Commands one connection may run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PermissionSet(BTreeSet<String>);

impl PermissionSet {
    pub fn new<I, S>(commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(commands.into_iter().map(Into::into).collect())
    }

    pub fn allows(&self, command: &str) -> bool {
        self.0.contains(command)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

/// Decides which commands a caller may run.
pub trait Authorizer: Send + Sync {
    fn authorize(
        &self,
        public_key: &VerifyingKey,
        origin: SocketAddr,
    ) -> Result<PermissionSet, AuthError>;
}

/// Shared authorizer handle.
pub type SharedAuthorizer = Arc<dyn Authorizer>;

/// Authorizer backed by a static command -> keys table.
#[derive(Debug, Default)]
pub struct KeyTableAuthorizer {
    /// Public key bytes -> permitted commands
    keys: HashMap<[u8; 32], PermissionSet>,
}

impl KeyTableAuthorizer {
    /// Build from a command -> base64 Ed25519 public keys table.
    pub fn from_table(table: &HashMap<String, Vec<String>>) -> Result<Self, AuthError> {
        let mut keys: HashMap<[u8; 32], BTreeSet<String>> = HashMap::new();

        for (command, encoded_keys) in table {
            for encoded in encoded_keys {
                let key = parse_public_key(encoded).map_err(|reason| {
                    AuthError::InvalidPublicKey {
                        command: command.clone(),
                        reason,
                    }
                })?;
                keys.entry(key.to_bytes())
                    .or_default()
                    .insert(command.clone());
            }
        }

        Ok(Self {
            keys: keys
                .into_iter()
                .map(|(key, commands)| (key, PermissionSet(commands)))
                .collect(),
        })
    }

    /// Number of distinct keys known.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl Authorizer for KeyTableAuthorizer {
    fn authorize(
        &self,
        public_key: &VerifyingKey,
        origin: SocketAddr,
    ) -> Result<PermissionSet, AuthError> {
        match self.keys.get(public_key.as_bytes()) {
            Some(permissions) if !permissions.is_empty() => {
                debug!(%origin, commands = ?permissions.0, "Key authorized");
                Ok(permissions.clone())
            }
            _ => Err(AuthError::Unauthorized),
        }
    }
}

/// Parse an Ed25519 verifying key from base64.
pub fn parse_public_key(encoded: &str) -> Result<VerifyingKey, String> {
    let bytes = BASE64.decode(encoded.trim()).map_err(|e| e.to_string())?;
    let arr: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| format!("expected 32 bytes, got {}", bytes.len()))?;
    VerifyingKey::from_bytes(&arr).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;

    fn generate_key() -> (VerifyingKey, String) {
        let verifying_key = SigningKey::generate(&mut OsRng).verifying_key();
        let encoded = BASE64.encode(verifying_key.to_bytes());
        (verifying_key, encoded)
    }

    fn origin() -> SocketAddr {
        "127.0.0.1:50000".parse().unwrap()
    }

    #[test]
    fn test_permissions_per_key() {
        let (reader, reader_b64) = generate_key();
        let (writer, writer_b64) = generate_key();

        let mut table = HashMap::new();
        table.insert("env".to_string(), vec![reader_b64.clone(), writer_b64.clone()]);
        table.insert("set".to_string(), vec![writer_b64.clone()]);
        table.insert("unset".to_string(), vec![writer_b64]);

        let authorizer = KeyTableAuthorizer::from_table(&table).unwrap();
        assert_eq!(authorizer.len(), 2);

        let permissions = authorizer.authorize(&reader, origin()).unwrap();
        assert_eq!(permissions, PermissionSet::new(["env"]));
        assert!(!permissions.allows("unset"));

        let permissions = authorizer.authorize(&writer, origin()).unwrap();
        assert_eq!(
            permissions.iter().collect::<Vec<_>>(),
            vec!["env", "set", "unset"]
        );
    }

    #[test]
    fn test_unknown_key_is_unauthorized() {
        let (_, known_b64) = generate_key();
        let (stranger, _) = generate_key();

        let mut table = HashMap::new();
        table.insert("env".to_string(), vec![known_b64]);
        let authorizer = KeyTableAuthorizer::from_table(&table).unwrap();

        assert!(matches!(
            authorizer.authorize(&stranger, origin()),
            Err(AuthError::Unauthorized)
        ));
    }

    #[test]
    fn test_empty_table_refuses_everyone() {
        let authorizer = KeyTableAuthorizer::from_table(&HashMap::new()).unwrap();
        assert!(authorizer.is_empty());
        let (key, _) = generate_key();
        assert!(authorizer.authorize(&key, origin()).is_err());
    }

    #[test]
    fn test_invalid_key_in_table() {
        let mut table = HashMap::new();
        table.insert("env".to_string(), vec!["not-valid-base64!!!".to_string()]);
        assert!(matches!(
            KeyTableAuthorizer::from_table(&table),
            Err(AuthError::InvalidPublicKey { .. })
        ));

        let mut table = HashMap::new();
        table.insert("env".to_string(), vec![BASE64.encode([1u8; 16])]);
        assert!(KeyTableAuthorizer::from_table(&table).is_err());
    }
}
