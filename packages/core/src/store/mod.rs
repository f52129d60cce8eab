//! Key/value store capability.
//!
//! [`ValueStore`] is the only shared mutable state the subsystem touches:
//! the cache layer reads and writes through it, and processing locks are
//! taken with [`ValueStore::set_if_absent`]. Two implementations ship:
//!
//! - [`InMemoryValueStore`]: a single-process store, used by tests and
//!   one-shot CLI runs.
//! - [`SqliteValueStore`]: backed by the `kv_store` table, safe to share
//!   between processes that open the same database file.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub mod memory;
pub mod sqlite;

pub use memory::InMemoryValueStore;
pub use sqlite::SqliteValueStore;

/// Failure of the underlying store. Consumers treat it as a miss.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store unavailable: {message}")]
    Unavailable { message: String },

    #[error("Store database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable { message: message.into() }
    }
}

/// Opaque TTL-aware key/value capability.
#[async_trait]
pub trait ValueStore: Send + Sync {
    /// Fetch the bytes stored under `key`, or `None` when absent or expired.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Store `value` under `key` for `ttl`, replacing any prior value.
    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool, StoreError>;

    /// Remove `key`. Returns `false` when nothing was stored.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Remove every key starting with `prefix` in one operation.
    /// Returns the number of entries removed.
    async fn delete_prefix(&self, prefix: &str) -> Result<u64, StoreError>;

    /// Atomically store `value` only if no unexpired value exists for `key`.
    ///
    /// Returns `true` when this call wrote the value.
    async fn set_if_absent(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> Result<bool, StoreError>;
}
