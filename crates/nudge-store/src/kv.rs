use async_trait::async_trait;
use chrono::Utc;
use rusqlite::OptionalExtension;
use tracing::{debug, instrument};

use nudge_core::{KeyValueStore, ReviewError};

use crate::database::Database;
use crate::error::StoreError;

/// Key-value persistence backed by the `kv` table.
#[derive(Clone)]
pub struct SqliteKvStore {
    db: Database,
}

impl SqliteKvStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn get_raw(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.db.with_conn(|conn| {
            let value = conn
                .query_row("SELECT value FROM kv WHERE key = ?1", [key], |row| row.get(0))
                .optional()?;
            Ok(value)
        })
    }

    pub fn set_raw(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                rusqlite::params![key, value, now],
            )?;
            Ok(())
        })
    }

    pub fn remove_raw(&self, key: &str) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let removed = conn.execute("DELETE FROM kv WHERE key = ?1", [key])?;
            Ok(removed > 0)
        })
    }

    /// All stored keys, sorted.
    pub fn keys(&self) -> Result<Vec<String>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT key FROM kv ORDER BY key")?;
            let keys = stmt
                .query_map([], |row| row.get(0))?
                .collect::<Result<Vec<String>, _>>()?;
            Ok(keys)
        })
    }
}

#[async_trait]
impl KeyValueStore for SqliteKvStore {
    #[instrument(skip(self), level = "trace")]
    async fn get(&self, key: &str) -> Result<Option<String>, ReviewError> {
        Ok(self.get_raw(key)?)
    }

    #[instrument(skip(self, value), level = "trace")]
    async fn set(&self, key: &str, value: &str) -> Result<(), ReviewError> {
        self.set_raw(key, value)?;
        debug!(key, bytes = value.len(), "kv written");
        Ok(())
    }

    #[instrument(skip(self), level = "trace")]
    async fn remove(&self, key: &str) -> Result<(), ReviewError> {
        self.remove_raw(key)?;
        Ok(())
    }
}
