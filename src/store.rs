//! Encrypted variable store.
//!
//! Joins a [`Backend`](crate::backend::Backend) with a
//! [`Crypter`](crate::crypter::Crypter): values are encrypted before they
//! reach the backend and authenticated before they are returned.

use std::collections::BTreeMap;
use std::time::Duration;

use thiserror::Error;
use zeroize::Zeroizing;

use crate::backend::{BackendError, SharedBackend};
use crate::crypter::{CrypterError, SharedCrypter};

/// Store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Variable {variable}: {source}")]
    Crypter {
        variable: String,
        #[source]
        source: CrypterError,
    },
}

/// Decrypted variables of one group, ordered by name.
pub type Variables = BTreeMap<String, Zeroizing<Vec<u8>>>;

#[derive(Clone)]
pub struct SecretStore {
    backend: SharedBackend,
    crypter: SharedCrypter,
}

impl SecretStore {
    pub fn new(backend: SharedBackend, crypter: SharedCrypter) -> Self {
        Self { backend, crypter }
    }

    /// Decrypt every variable of `group`. Nothing is returned unless every
    /// envelope validates.
    pub async fn read_group(&self, group: &str) -> Result<Variables, StoreError> {
        let envelopes = self.backend.get_group(group).await?;

        let mut variables = Variables::new();
        for (name, envelope) in envelopes {
            let value = self
                .crypter
                .validate_and_decrypt(&envelope)
                .map_err(|source| StoreError::Crypter {
                    variable: name.clone(),
                    source,
                })?;
            variables.insert(name, Zeroizing::new(value));
        }
        Ok(variables)
    }

    pub async fn read(&self, group: &str, variable: &str) -> Result<Zeroizing<Vec<u8>>, StoreError> {
        let envelope = self.backend.get_variable(group, variable).await?;
        let value = self
            .crypter
            .validate_and_decrypt(&envelope)
            .map_err(|source| StoreError::Crypter {
                variable: variable.to_string(),
                source,
            })?;
        Ok(Zeroizing::new(value))
    }

    /// Encrypt and store a value, optionally expiring after `ttl`.
    pub async fn write(
        &self,
        group: &str,
        variable: &str,
        value: &[u8],
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let envelope = self
            .crypter
            .encrypt_and_sign(value)
            .map_err(|source| StoreError::Crypter {
                variable: variable.to_string(),
                source,
            })?;

        match ttl {
            Some(ttl) => {
                self.backend
                    .set_variable_ttl(group, variable, &envelope, ttl)
                    .await?
            }
            None => self.backend.set_variable(group, variable, &envelope).await?,
        }
        Ok(())
    }

    pub async fn remove(&self, group: &str, variable: &str) -> Result<(), StoreError> {
        self.backend.remove_variable(group, variable).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Backend, MemoryBackend};
    use crate::crypter::{CrypterKind, KeyMaterial};
    use std::sync::Arc;

    fn store() -> (SecretStore, Arc<MemoryBackend>) {
        let backend = Arc::new(MemoryBackend::new("storetest"));
        let key = KeyMaterial::generate().unwrap();
        let crypter = CrypterKind::Std.build(&key).unwrap();
        (SecretStore::new(backend.clone(), crypter), backend)
    }

    #[tokio::test]
    async fn test_write_read_remove() {
        let (store, backend) = store();
        store.write("prod", "DB_PASSWORD", b"hunter2", None).await.unwrap();

        // The backend only ever sees the envelope.
        let envelope = backend.get_variable("prod", "DB_PASSWORD").await.unwrap();
        assert_ne!(envelope, b"hunter2");

        assert_eq!(&store.read("prod", "DB_PASSWORD").await.unwrap()[..], b"hunter2");
        let group = store.read_group("prod").await.unwrap();
        assert_eq!(group.len(), 1);

        store.remove("prod", "DB_PASSWORD").await.unwrap();
        assert!(store.read_group("prod").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_tampered_envelope_withholds_group() {
        let (store, backend) = store();
        store.write("prod", "A", b"1", None).await.unwrap();
        store.write("prod", "B", b"2", None).await.unwrap();

        let mut envelope = backend.get_variable("prod", "B").await.unwrap();
        let last = envelope.len() - 1;
        envelope[last] ^= 0x01;
        backend.set_variable("prod", "B", &envelope).await.unwrap();

        assert!(matches!(
            store.read_group("prod").await,
            Err(StoreError::Crypter { variable, source: CrypterError::InvalidSignature }) if variable == "B"
        ));
    }

    #[tokio::test]
    async fn test_ttl_is_passed_through() {
        let (store, _backend) = store();
        store
            .write("prod", "SHORT", b"v", Some(Duration::from_millis(10)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(matches!(
            store.read("prod", "SHORT").await,
            Err(StoreError::Backend(BackendError::NotFound { .. }))
        ));
    }
}
