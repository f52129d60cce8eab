//! In-memory content repository.
//!
//! Aggregate queries scan every item and sort in memory, so ranking is
//! O(n log n) per recompute; that is acceptable for tests and demos and
//! is exactly the work the aggregate cache exists to avoid.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{
    ContentId, ContentItem, ContentRepository, MeasuredTotals, MeasurementSnapshot, RankedPage,
    RepositoryError, UntestedPage, UntestedPages,
};
use crate::measurement::MeasurementReport;

#[derive(Debug, Default)]
pub struct InMemoryContentRepository {
    items: RwLock<BTreeMap<ContentId, ContentItem>>,
    reads: AtomicUsize,
}

impl InMemoryContentRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of read queries served so far.
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Remove an item, as an external unpublish/delete would.
    pub async fn remove_item(&self, id: ContentId) -> Option<ContentItem> {
        self.items.write().await.remove(&id)
    }

    fn record_read(&self) {
        self.reads.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ContentRepository for InMemoryContentRepository {
    async fn insert_item(&self, item: &ContentItem) -> Result<(), RepositoryError> {
        self.items.write().await.insert(item.id, item.clone());
        Ok(())
    }

    async fn get_item(&self, id: ContentId) -> Result<Option<ContentItem>, RepositoryError> {
        self.record_read();
        Ok(self.items.read().await.get(&id).cloned())
    }

    async fn get_emissions(&self, id: ContentId) -> Result<Option<f64>, RepositoryError> {
        self.record_read();
        Ok(self.items.read().await.get(&id).and_then(|i| i.emissions))
    }

    async fn measured_totals(&self) -> Result<MeasuredTotals, RepositoryError> {
        self.record_read();
        let items = self.items.read().await;
        let totals = items
            .values()
            .filter(|i| i.published)
            .filter_map(|i| i.emissions)
            .fold(MeasuredTotals::default(), |acc, e| MeasuredTotals {
                count: acc.count + 1,
                sum: acc.sum + e,
            });
        Ok(totals)
    }

    async fn heaviest(&self, limit: usize) -> Result<Vec<RankedPage>, RepositoryError> {
        self.record_read();
        let items = self.items.read().await;
        let mut ranked: Vec<RankedPage> = items
            .values()
            .filter(|i| i.published)
            .filter_map(|i| {
                i.emissions.map(|emissions| RankedPage {
                    id: i.id,
                    title: i.title.clone(),
                    url: i.url.clone(),
                    content_type: i.content_type.clone(),
                    emissions,
                    page_size_bytes: i.page_size_bytes,
                })
            })
            .collect();

        ranked.sort_by(|a, b| {
            b.emissions
                .total_cmp(&a.emissions)
                .then_with(|| a.id.cmp(&b.id))
        });
        ranked.truncate(limit);
        Ok(ranked)
    }

    async fn unmeasured(&self, per_type_limit: usize) -> Result<UntestedPages, RepositoryError> {
        self.record_read();
        let items = self.items.read().await;
        let mut grouped = UntestedPages::new();
        // BTreeMap iteration is already ascending by id.
        for item in items.values().filter(|i| i.published && !i.is_measured()) {
            let bucket = grouped.entry(item.content_type.clone()).or_default();
            if bucket.len() < per_type_limit {
                bucket.push(UntestedPage {
                    id: item.id,
                    title: item.title.clone(),
                    url: item.url.clone(),
                });
            }
        }
        grouped.retain(|_, pages| !pages.is_empty());
        Ok(grouped)
    }

    async fn save_measurement(
        &self,
        id: ContentId,
        report: &MeasurementReport,
        measured_at: DateTime<Utc>,
        history_limit: usize,
    ) -> Result<bool, RepositoryError> {
        let mut items = self.items.write().await;
        let Some(item) = items.get_mut(&id) else {
            return Ok(false);
        };

        item.emissions = Some(report.emissions_grams);
        item.page_size_bytes = Some(report.page_size_bytes);
        item.resources = report.resources.clone();
        item.last_measured_at = Some(measured_at);

        item.history.push(MeasurementSnapshot {
            emissions: report.emissions_grams,
            page_size_bytes: report.page_size_bytes,
            measured_at,
        });
        let excess = item.history.len().saturating_sub(history_limit);
        item.history.drain(..excess);

        Ok(true)
    }
}
