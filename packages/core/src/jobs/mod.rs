//! Deduplicated background measurement.
//!
//! Each content item moves `Idle -> Locked -> Idle`. The lock lives in the
//! shared [`ValueStore`] under `processing_lock:{id}` and is taken with
//! `set_if_absent`, which is the single commit point for scheduling. The
//! lock TTL bounds how long a crashed job can block an item.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::CacheSettings;
use crate::content::{ContentId, ContentItem, ContentRepository, RepositoryError};
use crate::measurement::{EmissionsMeasurer, MeasurementError};
use crate::metrics::AppMetrics;
use crate::stats::StatsAggregator;
use crate::store::ValueStore;

pub mod worker;

pub use worker::{drain_pending, run_backlog_polling, run_worker, schedule_untested};

const LOCK_KEY_PREFIX: &str = "processing_lock:";

pub fn lock_key(id: ContentId) -> String {
    format!("{}{}", LOCK_KEY_PREFIX, id)
}

/// Value stored under the lock key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingLock {
    pub content_id: ContentId,
    pub acquired_at: DateTime<Utc>,
    pub ttl_secs: u64,
}

/// Unit of queued work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessingJob {
    pub content_id: ContentId,
    pub enqueued_at: DateTime<Utc>,
}

pub type JobReceiver = mpsc::UnboundedReceiver<ProcessingJob>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleOutcome {
    /// Lock won and a job was enqueued.
    Scheduled,
    /// Another caller holds the lock.
    AlreadyLocked,
    /// Missing or unpublished.
    NotViewable,
    /// Measured recently enough.
    UpToDate,
    /// Store or queue failure; nothing was enqueued.
    Skipped,
}

#[derive(Error, Debug)]
pub enum JobError {
    #[error("Measurement failed: {0}")]
    Measurement(#[from] MeasurementError),

    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),
}

#[derive(Clone)]
pub struct JobCoordinator {
    store: Arc<dyn ValueStore>,
    repository: Arc<dyn ContentRepository>,
    measurer: Arc<dyn EmissionsMeasurer>,
    stats: StatsAggregator,
    settings: CacheSettings,
    sender: mpsc::UnboundedSender<ProcessingJob>,
    metrics: Option<Arc<AppMetrics>>,
}

impl JobCoordinator {
    pub fn new(
        store: Arc<dyn ValueStore>,
        repository: Arc<dyn ContentRepository>,
        measurer: Arc<dyn EmissionsMeasurer>,
        stats: StatsAggregator,
        settings: CacheSettings,
    ) -> (Self, JobReceiver) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let coordinator = Self {
            store,
            repository,
            measurer,
            stats,
            settings,
            sender,
            metrics: None,
        };
        (coordinator, receiver)
    }

    pub fn with_metrics(mut self, metrics: Arc<AppMetrics>) -> Self {
        self.stats = self.stats.with_metrics(metrics.clone());
        self.metrics = Some(metrics);
        self
    }

    /// Enqueue a measurement for `id` unless one is pending or unnecessary.
    ///
    /// Never blocks on the measurement itself.
    pub async fn maybe_schedule_processing(&self, id: ContentId) -> ScheduleOutcome {
        let item = match self.repository.get_item(id).await {
            Ok(Some(item)) if item.published => item,
            Ok(_) => return ScheduleOutcome::NotViewable,
            Err(err) => {
                tracing::warn!(content_id = %id, "Cannot check item before scheduling: {}", err);
                return ScheduleOutcome::Skipped;
            }
        };

        if !self.needs_measuring(&item, Utc::now()) {
            return ScheduleOutcome::UpToDate;
        }

        let lock = ProcessingLock {
            content_id: id,
            acquired_at: Utc::now(),
            ttl_secs: self.settings.lock_ttl.as_secs(),
        };
        let bytes = match serde_json::to_vec(&lock) {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::warn!(content_id = %id, "Cannot encode processing lock: {}", err);
                return ScheduleOutcome::Skipped;
            }
        };

        match self
            .store
            .set_if_absent(&lock_key(id), &bytes, self.settings.lock_ttl)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(content_id = %id, "Processing already pending");
                self.record(|m| m.jobs_skipped_total.inc());
                return ScheduleOutcome::AlreadyLocked;
            }
            Err(err) => {
                tracing::warn!(content_id = %id, "Lock acquisition failed, not scheduling: {}", err);
                self.record(|m| m.store_errors_total.inc());
                return ScheduleOutcome::Skipped;
            }
        }

        let job = ProcessingJob {
            content_id: id,
            enqueued_at: Utc::now(),
        };
        if self.sender.send(job).is_err() {
            tracing::warn!(content_id = %id, "Job queue closed, releasing lock");
            self.release_lock(id).await;
            return ScheduleOutcome::Skipped;
        }

        tracing::debug!(content_id = %id, "Scheduled emissions processing");
        self.record(|m| m.jobs_scheduled_total.inc());
        ScheduleOutcome::Scheduled
    }

    /// Measure, persist and invalidate. The lock is released on every path.
    pub async fn process_emissions(&self, id: ContentId) -> Result<(), JobError> {
        let result = self.measure_and_store(id).await;
        self.release_lock(id).await;

        match &result {
            Ok(()) => self.record(|m| m.jobs_completed_total.inc()),
            Err(err) => {
                tracing::error!(
                    content_id = %id,
                    measurer = self.measurer.measurer_name(),
                    "Emissions processing failed: {}",
                    err
                );
                self.record(|m| m.measurement_failures_total.inc());
            }
        }
        result
    }

    /// Delete the processing lock; store failures are logged and left to
    /// the lock TTL.
    pub async fn release_lock(&self, id: ContentId) {
        if let Err(err) = self.store.delete(&lock_key(id)).await {
            tracing::warn!(content_id = %id, "Lock release failed, will expire: {}", err);
            self.record(|m| m.store_errors_total.inc());
        }
    }

    async fn measure_and_store(&self, id: ContentId) -> Result<(), JobError> {
        let report = self.measurer.measure(id).await?;
        report.validate()?;

        let measured_at = Utc::now();
        let saved = self
            .repository
            .save_measurement(id, &report, measured_at, self.settings.history_limit)
            .await?;
        if !saved {
            tracing::warn!(content_id = %id, "Item vanished before measurement was stored");
        }

        self.stats.invalidate_item(id).await;
        tracing::info!(
            content_id = %id,
            emissions = report.emissions_grams,
            "Stored emissions measurement"
        );
        Ok(())
    }

    fn needs_measuring(&self, item: &ContentItem, now: DateTime<Utc>) -> bool {
        if item.emissions.is_none() {
            return true;
        }
        let Some(last) = item.last_measured_at else {
            return false;
        };
        match chrono::Duration::from_std(self.settings.stale_after) {
            Ok(stale_after) => now.signed_duration_since(last) > stale_after,
            Err(_) => false,
        }
    }

    fn record(&self, f: impl FnOnce(&AppMetrics)) {
        if let Some(m) = &self.metrics {
            f(m.as_ref());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::cache::{item_key, CacheLayer, CACHE_GROUP, SITE_STATS_KEY};
    use crate::content::InMemoryContentRepository;
    use crate::measurement::MockMeasurer;
    use crate::store::InMemoryValueStore;

    fn id(raw: u64) -> ContentId {
        ContentId::new(raw).unwrap()
    }

    struct Fixture {
        coordinator: JobCoordinator,
        receiver: JobReceiver,
        repo: Arc<InMemoryContentRepository>,
        store: Arc<InMemoryValueStore>,
        measurer: Arc<MockMeasurer>,
        cache: CacheLayer,
    }

    async fn fixture(measurer: MockMeasurer, settings: CacheSettings) -> Fixture {
        let repo = Arc::new(InMemoryContentRepository::new());
        repo.insert_item(&ContentItem::new(id(1), "Home", "https://site.test/", "page"))
            .await
            .unwrap();
        repo.insert_item(&ContentItem::new(id(2), "Draft", "https://site.test/d", "post").unpublished())
            .await
            .unwrap();

        let store = Arc::new(InMemoryValueStore::new());
        let cache = CacheLayer::new(store.clone());
        let stats = StatsAggregator::new(repo.clone(), cache.clone(), settings.clone());
        let measurer = Arc::new(measurer);
        let (coordinator, receiver) =
            JobCoordinator::new(store.clone(), repo.clone(), measurer.clone(), stats, settings);

        Fixture {
            coordinator,
            receiver,
            repo,
            store,
            measurer,
            cache,
        }
    }

    #[tokio::test]
    async fn schedules_unmeasured_item_once() {
        let mut f = fixture(MockMeasurer::new(), CacheSettings::default()).await;

        assert_eq!(
            f.coordinator.maybe_schedule_processing(id(1)).await,
            ScheduleOutcome::Scheduled
        );
        assert_eq!(
            f.coordinator.maybe_schedule_processing(id(1)).await,
            ScheduleOutcome::AlreadyLocked
        );

        let job = f.receiver.try_recv().unwrap();
        assert_eq!(job.content_id, id(1));
        assert!(f.receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn concurrent_schedules_enqueue_exactly_one_job() {
        let mut f = fixture(MockMeasurer::new(), CacheSettings::default()).await;

        let mut handles = Vec::new();
        for _ in 0..16 {
            let coordinator = f.coordinator.clone();
            handles.push(tokio::spawn(async move {
                coordinator.maybe_schedule_processing(id(1)).await
            }));
        }

        let mut scheduled = 0;
        for handle in handles {
            if handle.await.unwrap() == ScheduleOutcome::Scheduled {
                scheduled += 1;
            }
        }

        assert_eq!(scheduled, 1);
        assert!(f.receiver.try_recv().is_ok());
        assert!(f.receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn unpublished_and_missing_items_are_not_viewable() {
        let f = fixture(MockMeasurer::new(), CacheSettings::default()).await;
        assert_eq!(
            f.coordinator.maybe_schedule_processing(id(2)).await,
            ScheduleOutcome::NotViewable
        );
        assert_eq!(
            f.coordinator.maybe_schedule_processing(id(42)).await,
            ScheduleOutcome::NotViewable
        );
        assert!(f.store.is_empty().await);
    }

    #[tokio::test]
    async fn successful_processing_stores_result_and_releases_lock() {
        let mut f = fixture(MockMeasurer::new().with_emissions(id(1), 0.8), CacheSettings::default()).await;
        f.cache
            .set(CACHE_GROUP, SITE_STATS_KEY, &"stale", Duration::from_secs(60))
            .await;

        f.coordinator.maybe_schedule_processing(id(1)).await;
        let job = f.receiver.try_recv().unwrap();
        f.coordinator.process_emissions(job.content_id).await.unwrap();

        assert_eq!(f.repo.get_emissions(id(1)).await.unwrap(), Some(0.8));
        assert!(f.cache.get::<String>(CACHE_GROUP, SITE_STATS_KEY).await.is_none());
        assert!(f.cache.get::<f64>(CACHE_GROUP, &item_key(id(1))).await.is_none());
        assert!(f.store.get(&lock_key(id(1))).await.unwrap().is_none());

        assert_eq!(
            f.coordinator.maybe_schedule_processing(id(1)).await,
            ScheduleOutcome::UpToDate
        );
    }

    #[tokio::test]
    async fn failed_measurement_releases_lock_and_leaves_item_unmeasured() {
        let mut f = fixture(MockMeasurer::new().with_failure(id(1)), CacheSettings::default()).await;

        f.coordinator.maybe_schedule_processing(id(1)).await;
        let job = f.receiver.try_recv().unwrap();
        let err = f.coordinator.process_emissions(job.content_id).await.unwrap_err();

        assert!(matches!(err, JobError::Measurement(_)));
        assert_eq!(f.repo.get_emissions(id(1)).await.unwrap(), None);
        assert!(f.store.is_empty().await);
        assert_eq!(
            f.coordinator.maybe_schedule_processing(id(1)).await,
            ScheduleOutcome::Scheduled
        );
    }

    #[tokio::test]
    async fn invalid_report_is_rejected_without_persisting() {
        let f = fixture(MockMeasurer::new().with_emissions(id(1), -3.0), CacheSettings::default()).await;

        let err = f.coordinator.process_emissions(id(1)).await.unwrap_err();

        assert!(matches!(
            err,
            JobError::Measurement(MeasurementError::InvalidReport { .. })
        ));
        assert_eq!(f.repo.get_emissions(id(1)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn expired_lock_allows_rescheduling() {
        let settings = CacheSettings {
            lock_ttl: Duration::from_millis(30),
            ..CacheSettings::default()
        };
        let mut f = fixture(MockMeasurer::new(), settings).await;

        assert_eq!(
            f.coordinator.maybe_schedule_processing(id(1)).await,
            ScheduleOutcome::Scheduled
        );
        // Job is lost and the lock is never released.
        f.receiver.try_recv().unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;

        assert_eq!(
            f.coordinator.maybe_schedule_processing(id(1)).await,
            ScheduleOutcome::Scheduled
        );
    }

    #[tokio::test]
    async fn stale_measurement_is_rescheduled() {
        let settings = CacheSettings {
            stale_after: Duration::from_secs(60),
            ..CacheSettings::default()
        };
        let f = fixture(MockMeasurer::new(), settings).await;

        let mut item = ContentItem::new(id(3), "Old", "https://site.test/old", "post");
        item.emissions = Some(1.0);
        item.last_measured_at = Some(Utc::now() - chrono::Duration::hours(1));
        f.repo.insert_item(&item).await.unwrap();

        let mut fresh = ContentItem::new(id(4), "New", "https://site.test/new", "post");
        fresh.emissions = Some(1.0);
        fresh.last_measured_at = Some(Utc::now());
        f.repo.insert_item(&fresh).await.unwrap();

        assert_eq!(
            f.coordinator.maybe_schedule_processing(id(3)).await,
            ScheduleOutcome::Scheduled
        );
        assert_eq!(
            f.coordinator.maybe_schedule_processing(id(4)).await,
            ScheduleOutcome::UpToDate
        );
    }

    #[tokio::test]
    async fn store_failure_skips_scheduling() {
        let mut f = fixture(MockMeasurer::new(), CacheSettings::default()).await;
        f.store.set_unavailable(true);

        assert_eq!(
            f.coordinator.maybe_schedule_processing(id(1)).await,
            ScheduleOutcome::Skipped
        );
        assert!(f.receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn closed_queue_releases_lock() {
        let f = fixture(MockMeasurer::new(), CacheSettings::default()).await;
        let Fixture { coordinator, receiver, store, .. } = f;
        drop(receiver);

        assert_eq!(
            coordinator.maybe_schedule_processing(id(1)).await,
            ScheduleOutcome::Skipped
        );
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn measurer_is_called_once_per_processed_job() {
        let f = fixture(MockMeasurer::new().with_emissions(id(1), 1.0), CacheSettings::default()).await;
        f.coordinator.process_emissions(id(1)).await.unwrap();
        assert_eq!(f.measurer.call_count(), 1);
    }
}
