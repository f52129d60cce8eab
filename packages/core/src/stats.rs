//! Site-wide aggregates over measured content, served through the cache.
//!
//! Every read is cache-first. A miss recomputes from the repository and
//! writes the result back; repository failures propagate because there is
//! nothing left to fall back to.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cache::{
    heaviest_pages_key, item_key, CacheLayer, CACHE_GROUP, HEAVIEST_PAGES_KEY_PREFIX, SITE_STATS_KEY,
    UNTESTED_PAGES_KEY,
};
use crate::config::CacheSettings;
use crate::content::{ContentId, ContentRepository, RankedPage, RepositoryError, UntestedPages};
use crate::metrics::AppMetrics;

/// Cached site-wide summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteStatsSnapshot {
    pub total_measured: u64,
    /// Grams CO2e per measured item; 0 when nothing is measured.
    pub average_emissions: f64,
    pub total_emissions: f64,
    pub computed_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct StatsAggregator {
    repository: Arc<dyn ContentRepository>,
    cache: CacheLayer,
    settings: CacheSettings,
    metrics: Option<Arc<AppMetrics>>,
}

impl StatsAggregator {
    pub fn new(
        repository: Arc<dyn ContentRepository>,
        cache: CacheLayer,
        settings: CacheSettings,
    ) -> Self {
        Self {
            repository,
            cache,
            settings,
            metrics: None,
        }
    }

    /// Attach counters to this aggregator and its cache.
    pub fn with_metrics(mut self, metrics: Arc<AppMetrics>) -> Self {
        self.cache = self.cache.with_metrics(metrics.clone());
        self.metrics = Some(metrics);
        self
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    pub async fn get_site_stats(&self) -> Result<SiteStatsSnapshot, RepositoryError> {
        if let Some(snapshot) = self
            .cache
            .get::<SiteStatsSnapshot>(CACHE_GROUP, SITE_STATS_KEY)
            .await
        {
            return Ok(snapshot);
        }

        let totals = self.repository.measured_totals().await?;
        self.record_recompute();

        let average_emissions = if totals.count == 0 {
            0.0
        } else {
            totals.sum / totals.count as f64
        };

        let snapshot = SiteStatsSnapshot {
            total_measured: totals.count,
            average_emissions,
            total_emissions: totals.sum,
            computed_at: Utc::now(),
        };

        self.cache
            .set(CACHE_GROUP, SITE_STATS_KEY, &snapshot, self.settings.aggregate_ttl)
            .await;

        tracing::debug!(
            total_measured = snapshot.total_measured,
            "Recomputed site stats"
        );
        Ok(snapshot)
    }

    pub async fn get_total_measured(&self) -> Result<u64, RepositoryError> {
        Ok(self.get_site_stats().await?.total_measured)
    }

    pub async fn get_average_emissions(&self) -> Result<f64, RepositoryError> {
        Ok(self.get_site_stats().await?.average_emissions)
    }

    /// Top `limit` measured pages by emissions, heaviest first.
    ///
    /// `0` selects the configured default; larger values are clamped.
    pub async fn get_heaviest_pages(&self, limit: usize) -> Result<Vec<RankedPage>, RepositoryError> {
        let limit = self.settings.clamp_heaviest_limit(limit);
        let key = heaviest_pages_key(limit);

        if let Some(pages) = self.cache.get::<Vec<RankedPage>>(CACHE_GROUP, &key).await {
            return Ok(pages);
        }

        let pages = self.repository.heaviest(limit).await?;
        self.record_recompute();

        self.cache
            .set(CACHE_GROUP, &key, &pages, self.settings.aggregate_ttl)
            .await;
        Ok(pages)
    }

    /// Published, never-measured items grouped by content type.
    pub async fn get_untested_pages(&self) -> Result<UntestedPages, RepositoryError> {
        if let Some(pages) = self
            .cache
            .get::<UntestedPages>(CACHE_GROUP, UNTESTED_PAGES_KEY)
            .await
        {
            return Ok(pages);
        }

        let pages = self
            .repository
            .unmeasured(self.settings.max_untested_per_type)
            .await?;
        self.record_recompute();

        self.cache
            .set(CACHE_GROUP, UNTESTED_PAGES_KEY, &pages, self.settings.untested_ttl)
            .await;
        Ok(pages)
    }

    /// Drop the item's own entry and every aggregate. Safe to repeat.
    pub async fn invalidate_item(&self, id: ContentId) {
        self.cache.delete(CACHE_GROUP, &item_key(id)).await;
        self.invalidate_aggregates().await;
        tracing::debug!(content_id = %id, "Invalidated item and aggregates");
    }

    pub async fn invalidate_aggregates(&self) {
        self.cache.delete(CACHE_GROUP, SITE_STATS_KEY).await;
        self.cache
            .delete_prefix(CACHE_GROUP, HEAVIEST_PAGES_KEY_PREFIX)
            .await;
        self.cache.delete(CACHE_GROUP, UNTESTED_PAGES_KEY).await;
    }

    fn record_recompute(&self) {
        if let Some(m) = &self.metrics {
            m.aggregate_recomputes_total.inc();
        }
    }
}
