//! SQLite backend.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Pool, Row, Sqlite};
use tracing::info;

use super::{Backend, BackendError, BackendResult};

pub type DbPool = Pool<Sqlite>;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS variables (
    namespace TEXT NOT NULL,
    var_group TEXT NOT NULL,
    name TEXT NOT NULL,
    envelope BLOB NOT NULL,
    expires_at INTEGER,
    PRIMARY KEY (namespace, var_group, name)
)
"#;

/// Backend storing envelopes in a single `variables` table.
///
/// Several namespaces can share one database file. Expiry is stored as a
/// unix timestamp and filtered on read.
#[derive(Debug, Clone)]
pub struct SqliteBackend {
    pool: DbPool,
    namespace: String,
}

impl SqliteBackend {
    /// Connect to `url` and create the schema if needed.
    ///
    /// Use `sqlite://path/to/file.db?mode=rwc` to create the file on first
    /// use. An in-memory database (`sqlite::memory:`) is private to each pool
    /// connection, so pair it with `max_connections = 1`.
    pub async fn connect(url: &str, namespace: &str, max_connections: u32) -> BackendResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        info!("Database connected: {}", url);

        Self::with_pool(pool, namespace).await
    }

    /// Use an existing pool, creating the schema if needed.
    pub async fn with_pool(pool: DbPool, namespace: &str) -> BackendResult<Self> {
        sqlx::query(SCHEMA).execute(&pool).await?;
        Ok(Self {
            pool,
            namespace: namespace.to_string(),
        })
    }

    async fn upsert(
        &self,
        group: &str,
        variable: &str,
        value: &[u8],
        expires_at: Option<i64>,
    ) -> BackendResult<()> {
        sqlx::query(
            r#"
            INSERT INTO variables (namespace, var_group, name, envelope, expires_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(namespace, var_group, name) DO UPDATE SET
                envelope = excluded.envelope,
                expires_at = excluded.expires_at
            "#,
        )
        .bind(&self.namespace)
        .bind(group)
        .bind(variable)
        .bind(value)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl Backend for SqliteBackend {
    async fn get_variable(&self, group: &str, variable: &str) -> BackendResult<Vec<u8>> {
        let row = sqlx::query(
            r#"
            SELECT envelope FROM variables
            WHERE namespace = ? AND var_group = ? AND name = ?
              AND (expires_at IS NULL OR expires_at > ?)
            "#,
        )
        .bind(&self.namespace)
        .bind(group)
        .bind(variable)
        .bind(Utc::now().timestamp())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(row.try_get("envelope")?),
            None => Err(BackendError::NotFound {
                group: group.to_string(),
                variable: variable.to_string(),
            }),
        }
    }

    async fn set_variable(&self, group: &str, variable: &str, value: &[u8]) -> BackendResult<()> {
        self.upsert(group, variable, value, None).await
    }

    async fn set_variable_ttl(
        &self,
        group: &str,
        variable: &str,
        value: &[u8],
        ttl: Duration,
    ) -> BackendResult<()> {
        let expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|delta| Utc::now().checked_add_signed(delta))
            .ok_or(BackendError::TtlOutOfRange(ttl))?
            .timestamp();
        self.upsert(group, variable, value, Some(expires_at)).await
    }

    async fn remove_variable(&self, group: &str, variable: &str) -> BackendResult<()> {
        sqlx::query("DELETE FROM variables WHERE namespace = ? AND var_group = ? AND name = ?")
            .bind(&self.namespace)
            .bind(group)
            .bind(variable)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_group(&self, group: &str) -> BackendResult<HashMap<String, Vec<u8>>> {
        let rows = sqlx::query(
            r#"
            SELECT name, envelope FROM variables
            WHERE namespace = ? AND var_group = ?
              AND (expires_at IS NULL OR expires_at > ?)
            "#,
        )
        .bind(&self.namespace)
        .bind(group)
        .bind(Utc::now().timestamp())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| -> BackendResult<(String, Vec<u8>)> {
                Ok((row.try_get("name")?, row.try_get("envelope")?))
            })
            .collect()
    }

    async fn remove_group(&self, group: &str) -> BackendResult<()> {
        sqlx::query("DELETE FROM variables WHERE namespace = ? AND var_group = ?")
            .bind(&self.namespace)
            .bind(group)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
