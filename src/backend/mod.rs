//! Storage backends for encrypted variables.
//!
//! A backend is a namespaced key/value store: variables live in groups, and
//! every value is an opaque envelope produced by the cipher engine. Backends
//! never see plaintext.

pub mod memory;
pub mod sqlite;

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::BackendConfig;

pub use memory::MemoryBackend;
pub use sqlite::SqliteBackend;

/// Backend errors
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Variable {group}/{variable} not found")]
    NotFound { group: String, variable: String },

    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    #[error("Backend \"{0}\" has not been implemented")]
    UnknownKind(String),

    #[error("TTL of {0:?} is out of range")]
    TtlOutOfRange(Duration),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Result type for backend operations
pub type BackendResult<T> = Result<T, BackendError>;

/// Namespaced store of encrypted variables grouped by group name.
///
/// Implementations must be safe to call from many tasks at once.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn get_variable(&self, group: &str, variable: &str) -> BackendResult<Vec<u8>>;

    async fn set_variable(&self, group: &str, variable: &str, value: &[u8]) -> BackendResult<()>;

    /// Store a variable that stops being visible once `ttl` has elapsed.
    async fn set_variable_ttl(
        &self,
        group: &str,
        variable: &str,
        value: &[u8],
        ttl: Duration,
    ) -> BackendResult<()>;

    /// Remove a variable. Removing an absent variable is not an error.
    async fn remove_variable(&self, group: &str, variable: &str) -> BackendResult<()>;

    /// All live variables of a group. An empty group yields an empty map.
    async fn get_group(&self, group: &str) -> BackendResult<HashMap<String, Vec<u8>>>;

    async fn remove_group(&self, group: &str) -> BackendResult<()>;
}

/// Shared backend handle.
pub type SharedBackend = Arc<dyn Backend>;

/// Available backend implementations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Memory,
    Sqlite,
}

impl FromStr for BackendKind {
    type Err = BackendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "memory" => Ok(BackendKind::Memory),
            "sqlite" => Ok(BackendKind::Sqlite),
            other => Err(BackendError::UnknownKind(other.to_string())),
        }
    }
}

/// Open the backend described by `config`.
pub async fn connect(config: &BackendConfig) -> BackendResult<SharedBackend> {
    match config.kind.parse::<BackendKind>()? {
        BackendKind::Memory => Ok(Arc::new(MemoryBackend::new(&config.namespace))),
        BackendKind::Sqlite => Ok(Arc::new(
            SqliteBackend::connect(&config.url, &config.namespace, config.max_connections).await?,
        )),
    }
}
