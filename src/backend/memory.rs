//! In-process backend.
//!
//! Useful for tests and single-process deployments; contents are lost when
//! the process exits.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;

use super::{Backend, BackendError, BackendResult};

#[derive(Debug, Clone)]
struct Entry {
    envelope: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// Backend that keeps envelopes in a concurrent map.
#[derive(Debug)]
pub struct MemoryBackend {
    namespace: String,
    /// Keyed by (group, variable)
    entries: DashMap<(String, String), Entry>,
}

impl MemoryBackend {
    pub fn new(namespace: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            entries: DashMap::new(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn key(group: &str, variable: &str) -> (String, String) {
        (group.to_string(), variable.to_string())
    }

    fn insert(&self, group: &str, variable: &str, value: &[u8], expires_at: Option<Instant>) {
        self.entries.insert(
            Self::key(group, variable),
            Entry {
                envelope: value.to_vec(),
                expires_at,
            },
        );
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn get_variable(&self, group: &str, variable: &str) -> BackendResult<Vec<u8>> {
        let now = Instant::now();
        let key = Self::key(group, variable);
        let envelope = self
            .entries
            .get(&key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.envelope.clone());

        envelope.ok_or_else(|| {
            self.entries.remove_if(&key, |_, entry| !entry.is_live(now));
            BackendError::NotFound {
                group: group.to_string(),
                variable: variable.to_string(),
            }
        })
    }

    async fn set_variable(&self, group: &str, variable: &str, value: &[u8]) -> BackendResult<()> {
        self.insert(group, variable, value, None);
        Ok(())
    }

    async fn set_variable_ttl(
        &self,
        group: &str,
        variable: &str,
        value: &[u8],
        ttl: Duration,
    ) -> BackendResult<()> {
        let expires_at = Instant::now()
            .checked_add(ttl)
            .ok_or(BackendError::TtlOutOfRange(ttl))?;
        self.insert(group, variable, value, Some(expires_at));
        Ok(())
    }

    async fn remove_variable(&self, group: &str, variable: &str) -> BackendResult<()> {
        self.entries.remove(&Self::key(group, variable));
        Ok(())
    }

    async fn get_group(&self, group: &str) -> BackendResult<HashMap<String, Vec<u8>>> {
        let now = Instant::now();
        self.entries.retain(|_, entry| entry.is_live(now));
        Ok(self
            .entries
            .iter()
            .filter(|entry| entry.key().0 == group && entry.value().is_live(now))
            .map(|entry| (entry.key().1.clone(), entry.value().envelope.clone()))
            .collect())
    }

    async fn remove_group(&self, group: &str) -> BackendResult<()> {
        self.entries.retain(|(g, _), _| g != group);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend_pairs() -> HashMap<String, Vec<u8>> {
        let mut pairs = HashMap::new();
        pairs.insert("TESTVARIABLE1".to_string(), b"test value #1".to_vec());
        pairs.insert("TESTVARIABLE2".to_string(), b"test value #2".to_vec());
        pairs.insert("TESTVARIABLE3".to_string(), b"test value #3".to_vec());
        pairs
    }

    #[tokio::test]
    async fn test_set_get_remove() {
        let backend = MemoryBackend::new("memtest");
        for (variable, value) in backend_pairs() {
            backend.set_variable("testgroup", &variable, &value).await.unwrap();
        }

        for (variable, value) in backend_pairs() {
            assert_eq!(backend.get_variable("testgroup", &variable).await.unwrap(), value);
            backend.remove_variable("testgroup", &variable).await.unwrap();
            let group = backend.get_group("testgroup").await.unwrap();
            assert!(!group.contains_key(&variable));
        }

        // Removing again is not an error.
        backend.remove_variable("testgroup", "TESTVARIABLE1").await.unwrap();
    }

    #[tokio::test]
    async fn test_get_group() {
        let backend = MemoryBackend::new("memtest");
        for (variable, value) in backend_pairs() {
            backend.set_variable("testgroup", &variable, &value).await.unwrap();
        }
        backend.set_variable("othergroup", "OTHER", b"x").await.unwrap();

        assert_eq!(backend.get_group("testgroup").await.unwrap(), backend_pairs());

        backend.remove_group("testgroup").await.unwrap();
        assert!(backend.get_group("testgroup").await.unwrap().is_empty());
        assert_eq!(backend.get_group("othergroup").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_group() {
        let backend = MemoryBackend::new("memtest");
        assert!(backend.get_group("testgroup").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_variable() {
        let backend = MemoryBackend::new("memtest");
        assert!(matches!(
            backend.get_variable("testgroup", "ABSENT").await,
            Err(BackendError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let backend = MemoryBackend::new("memtest");
        backend
            .set_variable_ttl("testgroup", "SHORT", b"v", Duration::from_millis(20))
            .await
            .unwrap();
        backend
            .set_variable_ttl("testgroup", "LONG", b"v", Duration::from_secs(3600))
            .await
            .unwrap();
        assert_eq!(backend.get_group("testgroup").await.unwrap().len(), 2);

        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(backend.get_variable("testgroup", "SHORT").await.is_err());
        let group = backend.get_group("testgroup").await.unwrap();
        assert_eq!(group.len(), 1);
        assert!(group.contains_key("LONG"));
    }

    #[tokio::test]
    async fn test_expired_entries_are_purged() {
        let backend = MemoryBackend::new("memtest");
        for i in 0..10 {
            backend
                .set_variable_ttl("testgroup", &format!("V{}", i), b"v", Duration::from_millis(10))
                .await
                .unwrap();
        }
        backend
            .set_variable_ttl("other", "SHORT", b"v", Duration::from_millis(10))
            .await
            .unwrap();
        backend.set_variable("other", "KEEP", b"v").await.unwrap();
        assert_eq!(backend.entries.len(), 12);

        tokio::time::sleep(Duration::from_millis(30)).await;

        // Reading one variable drops it once it has expired.
        assert!(backend.get_variable("testgroup", "V0").await.is_err());
        assert_eq!(backend.entries.len(), 11);

        // Reading a group sweeps every expired entry.
        assert!(backend.get_group("testgroup").await.unwrap().is_empty());
        assert_eq!(backend.entries.len(), 1);
        assert!(backend.get_variable("other", "KEEP").await.is_ok());
    }

    #[tokio::test]
    async fn test_ttl_out_of_range() {
        let backend = MemoryBackend::new("memtest");
        assert!(matches!(
            backend
                .set_variable_ttl("testgroup", "A", b"v", Duration::MAX)
                .await,
            Err(BackendError::TtlOutOfRange(_))
        ));
        assert!(backend.get_group("testgroup").await.unwrap().is_empty());
    }
}
