use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;

use super::{EmissionsMeasurer, MeasurementError, MeasurementReport};
use crate::content::{ContentId, ContentRepository, ResourceBreakdown};

/// Measurer that asks a remote measurement API about an item's public URL.
#[derive(Clone)]
pub struct HttpMeasurementClient {
    base_url: String,
    http: Client,
    repository: Arc<dyn ContentRepository>,
}

impl HttpMeasurementClient {
    pub fn new(base_url: impl Into<String>, repository: Arc<dyn ContentRepository>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http: Client::new(),
            repository,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[derive(Debug, Deserialize)]
struct MeasureResponse {
    emissions: f64,
    page_size: u64,
    #[serde(default)]
    resources: ResourceBreakdown,
}

#[async_trait]
impl EmissionsMeasurer for HttpMeasurementClient {
    async fn measure(&self, id: ContentId) -> Result<MeasurementReport, MeasurementError> {
        let item = self
            .repository
            .get_item(id)
            .await?
            .ok_or(MeasurementError::NotFound { id })?;

        let url = format!("{}/measure", self.base_url);

        let response = self
            .http
            .get(&url)
            .query(&[("url", item.url.as_str())])
            .send()
            .await
            .map_err(|err| MeasurementError::network(err.to_string()))?;

        match response.status() {
            status if status.is_success() => {}
            StatusCode::NOT_FOUND => return Err(MeasurementError::NotFound { id }),
            StatusCode::SERVICE_UNAVAILABLE => return Err(MeasurementError::ServiceUnavailable),
            status => return Err(MeasurementError::Rejected { status: status.as_u16() }),
        }

        let body = response
            .json::<MeasureResponse>()
            .await
            .map_err(|err| MeasurementError::format(err.to_string()))?;

        Ok(MeasurementReport {
            emissions_grams: body.emissions,
            page_size_bytes: body.page_size,
            resources: body.resources,
        })
    }

    fn measurer_name(&self) -> &str {
        "http"
    }
}
