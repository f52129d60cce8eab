//! Persistent source of truth for content items.
//!
//! Every cached value in the crate can be rebuilt from a
//! [`ContentRepository`]. The SQLite implementation is the production
//! store; the in-memory one backs tests and demos.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::measurement::MeasurementReport;

pub mod memory;
pub mod sqlite;
pub mod types;

pub use memory::InMemoryContentRepository;
pub use sqlite::SqliteContentRepository;
pub use types::*;

/// Errors from the persistent content store.
#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Corrupt record for content {id}: {message}")]
    Corrupt { id: u64, message: String },
}

impl RepositoryError {
    pub fn corrupt(id: u64, message: impl Into<String>) -> Self {
        Self::Corrupt { id, message: message.into() }
    }
}

/// Persistent content store.
#[async_trait]
pub trait ContentRepository: Send + Sync {
    /// Insert or replace an item. Called by the publishing side, never by
    /// the measurement path.
    async fn insert_item(&self, item: &ContentItem) -> Result<(), RepositoryError>;

    async fn get_item(&self, id: ContentId) -> Result<Option<ContentItem>, RepositoryError>;

    /// Emissions of a single item; `None` when missing or unmeasured.
    async fn get_emissions(&self, id: ContentId) -> Result<Option<f64>, RepositoryError>;

    /// Count and sum over measured, published items.
    async fn measured_totals(&self) -> Result<MeasuredTotals, RepositoryError>;

    /// Up to `limit` measured, published items, heaviest first, ties by
    /// ascending id.
    async fn heaviest(&self, limit: usize) -> Result<Vec<RankedPage>, RepositoryError>;

    /// Unmeasured, published items grouped by content type, ascending id,
    /// at most `per_type_limit` per type.
    async fn unmeasured(&self, per_type_limit: usize) -> Result<UntestedPages, RepositoryError>;

    /// Persist a successful measurement and append it to the item's
    /// history, keeping only the newest `history_limit` snapshots.
    ///
    /// Returns `false` when the item does not exist.
    async fn save_measurement(
        &self,
        id: ContentId,
        report: &MeasurementReport,
        measured_at: DateTime<Utc>,
        history_limit: usize,
    ) -> Result<bool, RepositoryError>;
}
