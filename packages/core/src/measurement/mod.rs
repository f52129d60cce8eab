//! Emissions measurement capability.
//!
//! Turning a page into a grams-of-CO2e figure is an external concern; the
//! job coordinator only depends on [`EmissionsMeasurer`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::content::{ContentId, RepositoryError, ResourceBreakdown};

pub mod http;
pub mod mock;

pub use http::HttpMeasurementClient;
pub use mock::MockMeasurer;

/// Result of measuring one content item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementReport {
    pub emissions_grams: f64,
    pub page_size_bytes: u64,
    #[serde(default)]
    pub resources: ResourceBreakdown,
}

impl MeasurementReport {
    /// Reject figures that would poison the aggregates.
    pub fn validate(&self) -> Result<(), MeasurementError> {
        if !self.emissions_grams.is_finite() || self.emissions_grams < 0.0 {
            return Err(MeasurementError::invalid_report(format!(
                "emissions must be a non-negative number, got {}",
                self.emissions_grams
            )));
        }
        Ok(())
    }
}

/// Errors from an emissions measurer.
#[derive(Error, Debug)]
pub enum MeasurementError {
    #[error("Network error: {message}")]
    Network { message: String },

    #[error("Data format error: {message}")]
    Format { message: String },

    #[error("Content {id} not found")]
    NotFound { id: ContentId },

    #[error("Content lookup failed: {0}")]
    Lookup(#[from] RepositoryError),

    #[error("Measurement service rejected the request with HTTP {status}")]
    Rejected { status: u16 },

    #[error("Measurement service unavailable")]
    ServiceUnavailable,

    #[error("Invalid measurement report: {message}")]
    InvalidReport { message: String },
}

impl MeasurementError {
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network { message: message.into() }
    }

    pub fn format(message: impl Into<String>) -> Self {
        Self::Format { message: message.into() }
    }

    pub fn invalid_report(message: impl Into<String>) -> Self {
        Self::InvalidReport { message: message.into() }
    }
}

/// Opaque, potentially slow, fallible measurement of one content item.
#[async_trait]
pub trait EmissionsMeasurer: Send + Sync {
    async fn measure(&self, id: ContentId) -> Result<MeasurementReport, MeasurementError>;

    /// Name of this measurer for logging.
    fn measurer_name(&self) -> &str;
}
