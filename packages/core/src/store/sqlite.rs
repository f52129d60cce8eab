//! SQLite-backed [`ValueStore`].
//!
//! Rows live in the `kv_store` table with an absolute `expires_at` in
//! epoch milliseconds. Expired rows are invisible to reads and are
//! overwritten by `set_if_absent`; [`SqliteValueStore::purge_expired`]
//! reclaims them in bulk.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Row, SqlitePool};

use super::{StoreError, ValueStore};

/// Value store sharing the application's SQLite pool.
#[derive(Clone)]
pub struct SqliteValueStore {
    pool: SqlitePool,
}

impl SqliteValueStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Delete every expired row. Returns the number of rows removed.
    pub async fn purge_expired(&self) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM kv_store WHERE expires_at <= ?")
            .bind(now_millis())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn expiry_millis(ttl: Duration) -> i64 {
    let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
    now_millis().saturating_add(ttl_ms)
}

#[async_trait]
impl ValueStore for SqliteValueStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let row = sqlx::query("SELECT value FROM kv_store WHERE key = ? AND expires_at > ?")
            .bind(key)
            .bind(now_millis())
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| r.get::<Vec<u8>, _>("value")))
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool, StoreError> {
        sqlx::query(
            "INSERT INTO kv_store (key, value, expires_at) VALUES (?, ?, ?)
             ON CONFLICT (key) DO UPDATE
             SET value = excluded.value, expires_at = excluded.expires_at",
        )
        .bind(key)
        .bind(value)
        .bind(expiry_millis(ttl))
        .execute(&self.pool)
        .await?;

        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM kv_store WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64, StoreError> {
        // substr rather than LIKE: keys contain `_`.
        let result = sqlx::query("DELETE FROM kv_store WHERE substr(key, 1, length(?)) = ?")
            .bind(prefix)
            .bind(prefix)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    /// Single-statement upsert: the update branch only fires when the
    /// existing row has expired, so a live row is never overwritten and
    /// SQLite's write lock serialises competing processes.
    async fn set_if_absent(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let now = now_millis();
        let result = sqlx::query(
            "INSERT INTO kv_store (key, value, expires_at) VALUES (?, ?, ?)
             ON CONFLICT (key) DO UPDATE
             SET value = excluded.value, expires_at = excluded.expires_at
             WHERE kv_store.expires_at <= ?",
        )
        .bind(key)
        .bind(value)
        .bind(expiry_millis(ttl))
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}
