//! Background worker draining the processing queue.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio::time;

use super::{JobCoordinator, JobReceiver, ProcessingJob, ScheduleOutcome};
use crate::content::{ContentId, RepositoryError};
use crate::stats::StatsAggregator;

/// Run queued jobs with at most `concurrency` in flight.
///
/// Stops when the queue closes or `shutdown` resolves, then waits for the
/// jobs already started. Jobs still queued at shutdown are dropped and
/// their locks expire on their own.
pub async fn run_worker<F>(
    coordinator: JobCoordinator,
    mut receiver: JobReceiver,
    concurrency: usize,
    shutdown: F,
) where
    F: Future<Output = ()>,
{
    let concurrency = concurrency.max(1);
    let permits = Arc::new(Semaphore::new(concurrency));
    let mut tasks: JoinSet<()> = JoinSet::new();
    tokio::pin!(shutdown);

    tracing::info!("Processing worker started (concurrency: {})", concurrency);

    loop {
        tokio::select! {
            job = receiver.recv() => {
                let Some(ProcessingJob { content_id, .. }) = job else {
                    tracing::info!("Job queue closed. Stopping worker.");
                    break;
                };
                let Ok(permit) = permits.clone().acquire_owned().await else {
                    break;
                };
                let coordinator = coordinator.clone();
                tasks.spawn(async move {
                    let _guard = PanicLockGuard {
                        coordinator: coordinator.clone(),
                        id: content_id,
                    };
                    // Failures are logged by the coordinator.
                    let _ = coordinator.process_emissions(content_id).await;
                    drop(permit);
                });
            }

            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                log_aborted(joined);
            }

            _ = &mut shutdown => {
                tracing::info!("Shutdown signal received. Stopping worker.");
                break;
            }
        }
    }

    while let Some(joined) = tasks.join_next().await {
        log_aborted(joined);
    }

    tracing::info!("Processing worker stopped cleanly");
}

/// Process every job already queued, one at a time, without waiting for
/// new ones. Returns the number of jobs run.
pub async fn drain_pending(coordinator: &JobCoordinator, receiver: &mut JobReceiver) -> usize {
    let mut processed = 0;
    while let Ok(ProcessingJob { content_id, .. }) = receiver.try_recv() {
        let _ = coordinator.process_emissions(content_id).await;
        processed += 1;
    }
    processed
}

/// Try to schedule every published item that has never been measured.
/// Returns how many jobs were queued.
pub async fn schedule_untested(
    coordinator: &JobCoordinator,
    stats: &StatsAggregator,
) -> Result<usize, RepositoryError> {
    let untested = stats.get_untested_pages().await?;
    let mut scheduled = 0;
    for page in untested.values().flatten() {
        if coordinator.maybe_schedule_processing(page.id).await == ScheduleOutcome::Scheduled {
            scheduled += 1;
        }
    }
    Ok(scheduled)
}

/// Feed the untested backlog to the queue every `interval` until `shutdown`
/// resolves. Pair with [`run_worker`] on the same coordinator.
pub async fn run_backlog_polling<F>(
    coordinator: &JobCoordinator,
    stats: &StatsAggregator,
    interval: Duration,
    shutdown: F,
) where
    F: Future<Output = ()>,
{
    let interval = interval.max(Duration::from_secs(1));
    let mut ticker = time::interval(interval);
    tokio::pin!(shutdown);

    tracing::info!("Backlog polling started (interval: {}s)", interval.as_secs());

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match schedule_untested(coordinator, stats).await {
                    Ok(0) => tracing::debug!("No untested pages to schedule"),
                    Ok(n) => tracing::info!("Scheduled {} untested pages", n),
                    Err(err) => tracing::error!("Backlog polling error, skipping tick: {}", err),
                }
            }

            _ = &mut shutdown => {
                tracing::info!("Shutdown signal received. Stopping backlog polling.");
                break;
            }
        }
    }

    tracing::info!("Backlog polling stopped cleanly");
}

/// Releases the processing lock if the job task unwinds.
struct PanicLockGuard {
    coordinator: JobCoordinator,
    id: ContentId,
}

impl Drop for PanicLockGuard {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            return;
        }
        tracing::error!(content_id = %self.id, "Processing task panicked, releasing lock");
        let coordinator = self.coordinator.clone();
        let id = self.id;
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move { coordinator.release_lock(id).await });
        }
    }
}

fn log_aborted(joined: Result<(), JoinError>) {
    if let Err(err) = joined {
        tracing::error!("Processing task aborted: {}", err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::cache::CacheLayer;
    use crate::config::CacheSettings;
    use crate::content::{ContentItem, ContentRepository, InMemoryContentRepository};
    use crate::jobs::{lock_key, ScheduleOutcome};
    use crate::measurement::{EmissionsMeasurer, MeasurementError, MeasurementReport, MockMeasurer};
    use crate::stats::StatsAggregator;
    use crate::store::{InMemoryValueStore, ValueStore};

    fn id(raw: u64) -> ContentId {
        ContentId::new(raw).unwrap()
    }

    struct PanickingMeasurer;

    #[async_trait]
    impl EmissionsMeasurer for PanickingMeasurer {
        async fn measure(&self, _id: ContentId) -> Result<MeasurementReport, MeasurementError> {
            panic!("measurer exploded");
        }

        fn measurer_name(&self) -> &str {
            "panicking"
        }
    }

    async fn setup(
        measurer: Arc<dyn EmissionsMeasurer>,
        count: u64,
    ) -> (JobCoordinator, JobReceiver, Arc<InMemoryContentRepository>, Arc<InMemoryValueStore>) {
        let (coordinator, receiver, repo, store, _) = setup_with_stats(measurer, count).await;
        (coordinator, receiver, repo, store)
    }

    async fn setup_with_stats(
        measurer: Arc<dyn EmissionsMeasurer>,
        count: u64,
    ) -> (
        JobCoordinator,
        JobReceiver,
        Arc<InMemoryContentRepository>,
        Arc<InMemoryValueStore>,
        StatsAggregator,
    ) {
        let repo = Arc::new(InMemoryContentRepository::new());
        for raw in 1..=count {
            repo.insert_item(&ContentItem::new(id(raw), "t", "https://site.test", "post"))
                .await
                .unwrap();
        }
        let store = Arc::new(InMemoryValueStore::new());
        let settings = CacheSettings::default();
        let stats =
            StatsAggregator::new(repo.clone(), CacheLayer::new(store.clone()), settings.clone());
        let (coordinator, receiver) =
            JobCoordinator::new(store.clone(), repo.clone(), measurer, stats.clone(), settings);
        (coordinator, receiver, repo, store, stats)
    }

    async fn wait_until_empty(store: &InMemoryValueStore) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !store.is_empty().await {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn drain_pending_processes_queued_jobs() {
        let measurer = MockMeasurer::new()
            .with_emissions(id(1), 1.0)
            .with_emissions(id(2), 2.0);
        let (coordinator, mut receiver, repo, store) = setup(Arc::new(measurer), 2).await;

        coordinator.maybe_schedule_processing(id(1)).await;
        coordinator.maybe_schedule_processing(id(2)).await;

        assert_eq!(drain_pending(&coordinator, &mut receiver).await, 2);
        assert_eq!(repo.get_emissions(id(2)).await.unwrap(), Some(2.0));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn drain_pending_on_empty_queue_is_a_no_op() {
        let (coordinator, mut receiver, _, _) = setup(Arc::new(MockMeasurer::new()), 0).await;
        assert_eq!(drain_pending(&coordinator, &mut receiver).await, 0);
    }

    #[tokio::test]
    async fn worker_processes_jobs_and_stops_on_shutdown() {
        let measurer = MockMeasurer::new()
            .with_emissions(id(1), 1.0)
            .with_emissions(id(2), 2.0)
            .with_failure(id(3))
            .with_delay(Duration::from_millis(5));
        let (coordinator, receiver, repo, store) = setup(Arc::new(measurer), 3).await;
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();

        let worker = tokio::spawn(run_worker(coordinator.clone(), receiver, 2, async {
            let _ = rx.await;
        }));

        for raw in 1..=3 {
            assert_eq!(
                coordinator.maybe_schedule_processing(id(raw)).await,
                ScheduleOutcome::Scheduled
            );
        }

        wait_until_empty(&store).await;
        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), worker)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(repo.get_emissions(id(1)).await.unwrap(), Some(1.0));
        assert_eq!(repo.get_emissions(id(2)).await.unwrap(), Some(2.0));
        assert_eq!(repo.get_emissions(id(3)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn panicking_job_releases_its_lock() {
        let (coordinator, receiver, _, store) = setup(Arc::new(PanickingMeasurer), 1).await;
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();

        let worker = tokio::spawn(run_worker(coordinator.clone(), receiver, 1, async {
            let _ = rx.await;
        }));

        assert_eq!(
            coordinator.maybe_schedule_processing(id(1)).await,
            ScheduleOutcome::Scheduled
        );
        wait_until_empty(&store).await;
        assert!(store.get(&lock_key(id(1))).await.unwrap().is_none());

        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), worker)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn schedule_untested_skips_measured_and_locked_items() {
        let (coordinator, mut receiver, repo, _, stats) =
            setup_with_stats(Arc::new(MockMeasurer::new()), 4).await;
        repo.save_measurement(
            id(1),
            &MeasurementReport {
                emissions_grams: 0.3,
                page_size_bytes: 1_000,
                resources: Default::default(),
            },
            chrono::Utc::now(),
            10,
        )
        .await
        .unwrap();
        assert_eq!(
            coordinator.maybe_schedule_processing(id(2)).await,
            ScheduleOutcome::Scheduled
        );
        receiver.try_recv().unwrap();

        assert_eq!(schedule_untested(&coordinator, &stats).await.unwrap(), 2);

        let mut queued = Vec::new();
        while let Ok(job) = receiver.try_recv() {
            queued.push(job.content_id.get());
        }
        assert_eq!(queued, vec![3, 4]);
    }

    #[tokio::test]
    async fn backlog_polling_feeds_the_worker_until_shutdown() {
        let measurer = MockMeasurer::new()
            .with_emissions(id(1), 1.0)
            .with_emissions(id(2), 2.0);
        let (coordinator, receiver, repo, _, stats) =
            setup_with_stats(Arc::new(measurer), 2).await;
        let (worker_tx, worker_rx) = tokio::sync::oneshot::channel::<()>();
        let (poll_tx, poll_rx) = tokio::sync::oneshot::channel::<()>();

        let worker = tokio::spawn(run_worker(coordinator.clone(), receiver, 2, async {
            let _ = worker_rx.await;
        }));
        let polling = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                run_backlog_polling(&coordinator, &stats, Duration::from_secs(60), async {
                    let _ = poll_rx.await;
                })
                .await;
            })
        };

        // The first tick fires immediately.
        tokio::time::timeout(Duration::from_secs(5), async {
            while repo.get_emissions(id(2)).await.unwrap().is_none()
                || repo.get_emissions(id(1)).await.unwrap().is_none()
            {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        poll_tx.send(()).unwrap();
        worker_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), polling).await.unwrap().unwrap();
        tokio::time::timeout(Duration::from_secs(5), worker).await.unwrap().unwrap();
    }
}
