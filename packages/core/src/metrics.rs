//! Prometheus metrics registry for the emissions cache subsystem.
//!
//! [`AppMetrics`] owns all registered metrics and the [`Registry`] they
//! belong to. Construct it once at startup, wrap in `Arc`, and attach it
//! with `CarbonMetrics::with_metrics`.

use prometheus::{Counter, Opts, Registry};

/// All application-level Prometheus metrics.
pub struct AppMetrics {
    /// Cache lookups answered from the value store.
    pub cache_hits_total: Counter,
    /// Cache lookups that fell through to the source of truth.
    pub cache_misses_total: Counter,
    /// Value store operations that failed and were degraded.
    pub store_errors_total: Counter,
    /// Processing jobs enqueued after winning the lock.
    pub jobs_scheduled_total: Counter,
    /// Schedule attempts that lost the lock race.
    pub jobs_skipped_total: Counter,
    /// Jobs that persisted a new measurement.
    pub jobs_completed_total: Counter,
    /// Jobs whose measurement or persistence failed.
    pub measurement_failures_total: Counter,
    /// Aggregate queries recomputed from the repository.
    pub aggregate_recomputes_total: Counter,
    /// The registry that owns all of the above metrics.
    pub registry: Registry,
}

impl AppMetrics {
    /// Create and register all metrics.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let counter = |name: &str, help: &str| -> Result<Counter, prometheus::Error> {
            let c = Counter::with_opts(Opts::new(name, help))?;
            registry.register(Box::new(c.clone()))?;
            Ok(c)
        };

        Ok(Self {
            cache_hits_total: counter("carbon_metrics_cache_hits_total", "Cache hits")?,
            cache_misses_total: counter("carbon_metrics_cache_misses_total", "Cache misses")?,
            store_errors_total: counter(
                "carbon_metrics_store_errors_total",
                "Value store failures degraded to a miss",
            )?,
            jobs_scheduled_total: counter(
                "carbon_metrics_jobs_scheduled_total",
                "Processing jobs enqueued",
            )?,
            jobs_skipped_total: counter(
                "carbon_metrics_jobs_skipped_total",
                "Schedule attempts skipped because a lock was held",
            )?,
            jobs_completed_total: counter(
                "carbon_metrics_jobs_completed_total",
                "Processing jobs that stored a measurement",
            )?,
            measurement_failures_total: counter(
                "carbon_metrics_measurement_failures_total",
                "Processing jobs that failed",
            )?,
            aggregate_recomputes_total: counter(
                "carbon_metrics_aggregate_recomputes_total",
                "Aggregate queries recomputed from the repository",
            )?,
            registry,
        })
    }

    /// Render all metrics as Prometheus text format.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buf = Vec::new();
        encoder.encode(&metric_families, &mut buf)?;
        Ok(String::from_utf8(buf).unwrap_or_default())
    }
}
