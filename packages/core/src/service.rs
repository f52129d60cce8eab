//! Wiring of the cache, aggregator, facade, coordinator and hooks.

use std::sync::Arc;

use crate::cache::CacheLayer;
use crate::config::CacheSettings;
use crate::content::{ContentId, ContentRepository, RankedPage, RepositoryError, UntestedPages};
use crate::facade::{MetricsFacade, PostEmissions};
use crate::hooks::{CacheInvalidationHandler, HooksManager};
use crate::jobs::{JobCoordinator, JobReceiver, ScheduleOutcome};
use crate::measurement::EmissionsMeasurer;
use crate::metrics::AppMetrics;
use crate::stats::{SiteStatsSnapshot, StatsAggregator};
use crate::store::ValueStore;

/// Entry point for callers: read-through metrics plus deduplicated
/// background measurement. All capabilities are injected.
#[derive(Clone)]
pub struct CarbonMetrics {
    stats: StatsAggregator,
    facade: MetricsFacade,
    coordinator: JobCoordinator,
    hooks: HooksManager,
}

impl CarbonMetrics {
    /// Returns the service and the receiving end of its job queue, to be
    /// handed to [`crate::jobs::run_worker`] or drained inline.
    pub fn new(
        store: Arc<dyn ValueStore>,
        repository: Arc<dyn ContentRepository>,
        measurer: Arc<dyn EmissionsMeasurer>,
        settings: CacheSettings,
    ) -> (Self, JobReceiver) {
        let cache = CacheLayer::new(store.clone());
        let stats = StatsAggregator::new(repository.clone(), cache.clone(), settings.clone());
        let facade = MetricsFacade::new(repository.clone(), cache, settings.clone());
        let (coordinator, receiver) =
            JobCoordinator::new(store, repository, measurer, stats.clone(), settings);
        let hooks = default_hooks(&stats);

        let service = Self {
            stats,
            facade,
            coordinator,
            hooks,
        };
        (service, receiver)
    }

    /// Attach Prometheus counters to every component.
    ///
    /// Rebuilds the hook list, so call it before registering extra handlers.
    pub fn with_metrics(self, metrics: Arc<AppMetrics>) -> Self {
        let stats = self.stats.with_metrics(metrics.clone());
        let hooks = default_hooks(&stats);
        Self {
            facade: self.facade.with_metrics(metrics.clone()),
            coordinator: self.coordinator.with_metrics(metrics),
            stats,
            hooks,
        }
    }

    pub async fn get_site_stats(&self) -> Result<SiteStatsSnapshot, RepositoryError> {
        self.stats.get_site_stats().await
    }

    pub async fn get_heaviest_pages(&self, limit: usize) -> Result<Vec<RankedPage>, RepositoryError> {
        self.stats.get_heaviest_pages(limit).await
    }

    pub async fn get_untested_pages(&self) -> Result<UntestedPages, RepositoryError> {
        self.stats.get_untested_pages().await
    }

    pub async fn get_post_emissions(&self, id: ContentId) -> Result<PostEmissions, RepositoryError> {
        self.facade.get_post_emissions(id).await
    }

    pub async fn maybe_schedule_processing(&self, id: ContentId) -> ScheduleOutcome {
        self.coordinator.maybe_schedule_processing(id).await
    }

    pub fn stats(&self) -> &StatsAggregator {
        &self.stats
    }

    pub fn facade(&self) -> &MetricsFacade {
        &self.facade
    }

    pub fn coordinator(&self) -> &JobCoordinator {
        &self.coordinator
    }

    pub fn hooks(&self) -> &HooksManager {
        &self.hooks
    }

    pub fn hooks_mut(&mut self) -> &mut HooksManager {
        &mut self.hooks
    }
}

fn default_hooks(stats: &StatsAggregator) -> HooksManager {
    let mut hooks = HooksManager::new();
    hooks.register(Arc::new(CacheInvalidationHandler::new(stats.clone())));
    hooks
}
