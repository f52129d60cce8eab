//! Scripted measurer for tests and offline runs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::{EmissionsMeasurer, MeasurementError, MeasurementReport};
use crate::content::{ContentId, ResourceBreakdown};

#[derive(Debug, Clone)]
enum Scripted {
    Report(MeasurementReport),
    Fail,
}

/// Returns preset reports per item; unscripted items fail with
/// `ServiceUnavailable`.
#[derive(Debug, Default)]
pub struct MockMeasurer {
    scripted: HashMap<ContentId, Scripted>,
    delay: Option<Duration>,
    calls: AtomicUsize,
    seen: Mutex<Vec<ContentId>>,
}

impl MockMeasurer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_emissions(mut self, id: ContentId, emissions_grams: f64) -> Self {
        self.scripted.insert(
            id,
            Scripted::Report(MeasurementReport {
                emissions_grams,
                page_size_bytes: (emissions_grams.max(0.0) * 1_000_000.0) as u64,
                resources: ResourceBreakdown::new(),
            }),
        );
        self
    }

    pub fn with_report(mut self, id: ContentId, report: MeasurementReport) -> Self {
        self.scripted.insert(id, Scripted::Report(report));
        self
    }

    pub fn with_failure(mut self, id: ContentId) -> Self {
        self.scripted.insert(id, Scripted::Fail);
        self
    }

    /// Sleep before answering, to simulate a slow measurement.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Ids measured so far, in call order.
    pub fn measured_ids(&self) -> Vec<ContentId> {
        self.seen.lock().map(|seen| seen.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl EmissionsMeasurer for MockMeasurer {
    async fn measure(&self, id: ContentId) -> Result<MeasurementReport, MeasurementError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut seen) = self.seen.lock() {
            seen.push(id);
        }

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        match self.scripted.get(&id) {
            Some(Scripted::Report(report)) => Ok(report.clone()),
            Some(Scripted::Fail) | None => Err(MeasurementError::ServiceUnavailable),
        }
    }

    fn measurer_name(&self) -> &str {
        "mock"
    }
}
