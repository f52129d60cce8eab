//! Core data types for measured content.

use std::collections::BTreeMap;
use std::fmt;
use std::num::NonZeroU64;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Resource type (`scripts`, `images`, ...) → resource name → size in bytes.
pub type ResourceBreakdown = BTreeMap<String, BTreeMap<String, u64>>;

/// Identifier of a content item.
///
/// Valid ids are `1..=ContentId::MAX`, the positive range of a SQLite
/// `INTEGER` key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u64", into = "u64")]
pub struct ContentId(NonZeroU64);

impl ContentId {
    pub const MAX: u64 = i64::MAX as u64;

    /// Returns `None` for zero or anything above [`ContentId::MAX`].
    pub fn new(raw: u64) -> Option<Self> {
        if raw > Self::MAX {
            return None;
        }
        NonZeroU64::new(raw).map(Self)
    }

    pub fn get(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<u64> for ContentId {
    type Error = String;

    fn try_from(raw: u64) -> Result<Self, Self::Error> {
        Self::new(raw).ok_or_else(|| format!("content id must be in 1..={}", Self::MAX))
    }
}

impl From<ContentId> for u64 {
    fn from(id: ContentId) -> Self {
        id.get()
    }
}

/// One past measurement of a content item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementSnapshot {
    pub emissions: f64,
    pub page_size_bytes: u64,
    pub measured_at: DateTime<Utc>,
}

/// A measurable page or post.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentItem {
    pub id: ContentId,
    pub title: String,
    pub url: String,
    pub content_type: String,
    /// Only published items are viewable, schedulable and aggregated.
    pub published: bool,
    /// Grams CO2e; `None` until the first successful measurement.
    pub emissions: Option<f64>,
    pub page_size_bytes: Option<u64>,
    pub resources: ResourceBreakdown,
    pub last_measured_at: Option<DateTime<Utc>>,
    /// Oldest first, bounded by the configured history limit.
    pub history: Vec<MeasurementSnapshot>,
}

impl ContentItem {
    /// A freshly published, unmeasured item.
    pub fn new(
        id: ContentId,
        title: impl Into<String>,
        url: impl Into<String>,
        content_type: impl Into<String>,
    ) -> Self {
        Self {
            id,
            title: title.into(),
            url: url.into(),
            content_type: content_type.into(),
            published: true,
            emissions: None,
            page_size_bytes: None,
            resources: ResourceBreakdown::new(),
            last_measured_at: None,
            history: Vec::new(),
        }
    }

    pub fn unpublished(mut self) -> Self {
        self.published = false;
        self
    }

    pub fn is_measured(&self) -> bool {
        self.emissions.is_some()
    }
}

/// Row of the heaviest-pages ranking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedPage {
    pub id: ContentId,
    pub title: String,
    pub url: String,
    pub content_type: String,
    pub emissions: f64,
    pub page_size_bytes: Option<u64>,
}

/// A published item that has never been measured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UntestedPage {
    pub id: ContentId,
    pub title: String,
    pub url: String,
}

/// Untested pages grouped by content type.
pub type UntestedPages = BTreeMap<String, Vec<UntestedPage>>;

/// Count and sum of emissions over measured, published items.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MeasuredTotals {
    pub count: u64,
    pub sum: f64,
}
