//! Per-item read API used by display code.

use std::sync::Arc;

use serde::Serialize;

use crate::cache::{item_key, CacheLayer, CACHE_GROUP};
use crate::config::CacheSettings;
use crate::content::{
    ContentId, ContentRepository, MeasurementSnapshot, RepositoryError, ResourceBreakdown,
};
use crate::metrics::AppMetrics;

/// Emissions of a single item as seen by callers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "status", content = "grams", rename_all = "snake_case")]
pub enum PostEmissions {
    Measured(f64),
    /// No measurement yet. Never cached.
    Unmeasured,
}

impl PostEmissions {
    pub fn grams(self) -> Option<f64> {
        match self {
            Self::Measured(grams) => Some(grams),
            Self::Unmeasured => None,
        }
    }
}

#[derive(Clone)]
pub struct MetricsFacade {
    repository: Arc<dyn ContentRepository>,
    cache: CacheLayer,
    settings: CacheSettings,
}

impl MetricsFacade {
    pub fn new(
        repository: Arc<dyn ContentRepository>,
        cache: CacheLayer,
        settings: CacheSettings,
    ) -> Self {
        Self {
            repository,
            cache,
            settings,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<AppMetrics>) -> Self {
        self.cache = self.cache.with_metrics(metrics);
        self
    }

    /// Cache-first emissions lookup; measured values are written through.
    pub async fn get_post_emissions(&self, id: ContentId) -> Result<PostEmissions, RepositoryError> {
        let key = item_key(id);
        if let Some(grams) = self.cache.get::<f64>(CACHE_GROUP, &key).await {
            return Ok(PostEmissions::Measured(grams));
        }

        match self.repository.get_emissions(id).await? {
            Some(grams) => {
                self.cache
                    .set(CACHE_GROUP, &key, &grams, self.settings.item_ttl)
                    .await;
                Ok(PostEmissions::Measured(grams))
            }
            None => Ok(PostEmissions::Unmeasured),
        }
    }

    /// Resource breakdown from the last measurement, if any.
    pub async fn get_post_resources(
        &self,
        id: ContentId,
    ) -> Result<Option<ResourceBreakdown>, RepositoryError> {
        let resources = self
            .repository
            .get_item(id)
            .await?
            .map(|item| item.resources)
            .filter(|resources| !resources.is_empty());
        Ok(resources)
    }

    /// Retained measurement snapshots, oldest first.
    pub async fn get_post_history(
        &self,
        id: ContentId,
    ) -> Result<Vec<MeasurementSnapshot>, RepositoryError> {
        Ok(self
            .repository
            .get_item(id)
            .await?
            .map(|item| item.history)
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use chrono::Utc;

    use crate::content::{ContentItem, InMemoryContentRepository};
    use crate::measurement::MeasurementReport;
    use crate::store::InMemoryValueStore;

    fn id(raw: u64) -> ContentId {
        ContentId::new(raw).unwrap()
    }

    async fn setup() -> (MetricsFacade, Arc<InMemoryContentRepository>, Arc<InMemoryValueStore>) {
        let repo = Arc::new(InMemoryContentRepository::new());
        let mut measured = ContentItem::new(id(1), "Home", "https://site.test/", "page");
        measured.emissions = Some(0.75);
        repo.insert_item(&measured).await.unwrap();
        repo.insert_item(&ContentItem::new(id(2), "About", "https://site.test/about", "page"))
            .await
            .unwrap();

        let store = Arc::new(InMemoryValueStore::new());
        let facade = MetricsFacade::new(
            repo.clone(),
            CacheLayer::new(store.clone()),
            CacheSettings::default(),
        );
        (facade, repo, store)
    }

    #[tokio::test]
    async fn cache_hit_skips_repository() {
        let (facade, repo, _) = setup().await;

        assert_eq!(
            facade.get_post_emissions(id(1)).await.unwrap(),
            PostEmissions::Measured(0.75)
        );
        let reads = repo.read_count();

        assert_eq!(
            facade.get_post_emissions(id(1)).await.unwrap(),
            PostEmissions::Measured(0.75)
        );
        assert_eq!(repo.read_count(), reads);
    }

    #[tokio::test]
    async fn unmeasured_sentinel_is_never_cached() {
        let (facade, repo, store) = setup().await;

        assert_eq!(
            facade.get_post_emissions(id(2)).await.unwrap(),
            PostEmissions::Unmeasured
        );
        assert!(store.is_empty().await);

        repo.save_measurement(
            id(2),
            &MeasurementReport {
                emissions_grams: 2.0,
                page_size_bytes: 10,
                resources: BTreeMap::new(),
            },
            Utc::now(),
            10,
        )
        .await
        .unwrap();

        assert_eq!(
            facade.get_post_emissions(id(2)).await.unwrap(),
            PostEmissions::Measured(2.0)
        );
    }

    #[tokio::test]
    async fn unknown_item_is_unmeasured() {
        let (facade, _, _) = setup().await;
        assert_eq!(facade.get_post_emissions(id(99)).await.unwrap().grams(), None);
    }

    #[tokio::test]
    async fn resources_and_history_follow_measurements() {
        let (facade, repo, _) = setup().await;
        assert!(facade.get_post_resources(id(2)).await.unwrap().is_none());
        assert!(facade.get_post_history(id(2)).await.unwrap().is_empty());

        let mut resources = BTreeMap::new();
        resources.insert(
            "images".to_string(),
            BTreeMap::from([("hero.jpg".to_string(), 120_000_u64)]),
        );
        let report = MeasurementReport {
            emissions_grams: 1.5,
            page_size_bytes: 200_000,
            resources,
        };
        repo.save_measurement(id(2), &report, Utc::now(), 10).await.unwrap();

        let stored = facade.get_post_resources(id(2)).await.unwrap().unwrap();
        assert_eq!(stored["images"]["hero.jpg"], 120_000);
        assert_eq!(facade.get_post_history(id(2)).await.unwrap().len(), 1);
    }
}
