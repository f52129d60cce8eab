//! Read-through cache over a [`ValueStore`].
//!
//! Entries are namespaced by group and carry their own creation and expiry
//! timestamps, so a stale value is never returned even when the backing
//! store keeps rows past their TTL. The cache is strictly a performance
//! layer: any store failure is logged and reported as a miss.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::content::ContentId;
use crate::metrics::AppMetrics;
use crate::store::ValueStore;

/// Namespace for every entry written by this crate.
pub const CACHE_GROUP: &str = "carbon_metrics";
pub const SITE_STATS_KEY: &str = "site_stats";
pub const UNTESTED_PAGES_KEY: &str = "untested_pages";
pub const HEAVIEST_PAGES_KEY_PREFIX: &str = "heaviest_pages_";
const ITEM_KEY_PREFIX: &str = "emissions_";

pub fn heaviest_pages_key(limit: usize) -> String {
    format!("{}{}", HEAVIEST_PAGES_KEY_PREFIX, limit)
}

pub fn item_key(id: ContentId) -> String {
    format!("{}{}", ITEM_KEY_PREFIX, id)
}

/// Envelope persisted for every cached value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    pub key: String,
    pub group: String,
    pub value: T,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl<T> CacheEntry<T> {
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

/// Cheap-to-clone handle; clones share the same store and metrics.
#[derive(Clone)]
pub struct CacheLayer {
    store: Arc<dyn ValueStore>,
    metrics: Option<Arc<AppMetrics>>,
}

impl CacheLayer {
    pub fn new(store: Arc<dyn ValueStore>) -> Self {
        Self { store, metrics: None }
    }

    pub fn with_metrics(mut self, metrics: Arc<AppMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Returns the cached value only when present, decodable and unexpired.
    pub async fn get<T: DeserializeOwned>(&self, group: &str, key: &str) -> Option<T> {
        let physical = physical_key(group, key);

        let bytes = match self.store.get(&physical).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                self.record_miss();
                return None;
            }
            Err(err) => {
                tracing::warn!(key = %physical, "Cache read failed, treating as miss: {}", err);
                self.record_store_error();
                self.record_miss();
                return None;
            }
        };

        match serde_json::from_slice::<CacheEntry<T>>(&bytes) {
            Ok(entry) if entry.is_fresh(Utc::now()) => {
                self.record_hit();
                Some(entry.value)
            }
            Ok(_) => {
                self.record_miss();
                None
            }
            Err(err) => {
                tracing::warn!(key = %physical, "Discarding undecodable cache entry: {}", err);
                self.record_miss();
                None
            }
        }
    }

    /// Overwrites any prior entry for `(group, key)`.
    pub async fn set<T: Serialize>(&self, group: &str, key: &str, value: &T, ttl: Duration) {
        let physical = physical_key(group, key);
        let created_at = Utc::now();
        let expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| created_at.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        let entry = CacheEntry {
            key: key.to_string(),
            group: group.to_string(),
            value,
            created_at,
            expires_at,
        };

        let bytes = match serde_json::to_vec(&entry) {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::warn!(key = %physical, "Skipping cache write, encode failed: {}", err);
                return;
            }
        };

        if let Err(err) = self.store.set(&physical, &bytes, ttl).await {
            tracing::warn!(key = %physical, "Cache write failed: {}", err);
            self.record_store_error();
        }
    }

    /// Idempotent removal; absent keys and store failures are ignored.
    pub async fn delete(&self, group: &str, key: &str) {
        let physical = physical_key(group, key);
        if let Err(err) = self.store.delete(&physical).await {
            tracing::warn!(key = %physical, "Cache delete failed: {}", err);
            self.record_store_error();
        }
    }

    /// Remove every key in `group` starting with `prefix`. Failures are
    /// ignored like in [`CacheLayer::delete`].
    pub async fn delete_prefix(&self, group: &str, prefix: &str) {
        let physical = physical_key(group, prefix);
        if let Err(err) = self.store.delete_prefix(&physical).await {
            tracing::warn!(prefix = %physical, "Cache prefix delete failed: {}", err);
            self.record_store_error();
        }
    }

    fn record_hit(&self) {
        if let Some(m) = &self.metrics {
            m.cache_hits_total.inc();
        }
    }

    fn record_miss(&self) {
        if let Some(m) = &self.metrics {
            m.cache_misses_total.inc();
        }
    }

    fn record_store_error(&self) {
        if let Some(m) = &self.metrics {
            m.store_errors_total.inc();
        }
    }
}

fn physical_key(group: &str, key: &str) -> String {
    format!("{}:{}", group, key)
}
