//! Upstream metrics fetcher.
//!
//! One HTTP GET per pass. The payload must carry numeric `bigPrice` and
//! `blocksUntilHalving`; anything else (transport error, non-2xx, missing or
//! mistyped field) is logged and replaced by `Metrics::default()` so a metrics
//! outage never stalls reconciliation.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

use crate::models::Metrics;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("metrics request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("metrics payload rejected: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Anything that can produce the current metrics snapshot. Never fails.
#[async_trait]
pub trait MetricsSource: Send + Sync {
    async fn fetch(&self) -> Metrics;
}

/// Wire shape of the stats endpoint; extra fields are ignored.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatsPayload {
    big_price: f64,
    blocks_until_halving: f64,
}

pub fn parse_metrics(body: &[u8]) -> Result<Metrics, MetricsError> {
    let payload: StatsPayload = serde_json::from_slice(body)?;
    Ok(Metrics {
        price: payload.big_price,
        countdown: payload.blocks_until_halving,
    })
}

pub struct HttpMetricsSource {
    client: Client,
    url: String,
}

impl HttpMetricsSource {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, MetricsError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }

    async fn try_fetch(&self) -> Result<Metrics, MetricsError> {
        let body = self
            .client
            .get(&self.url)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        parse_metrics(&body)
    }
}

#[async_trait]
impl MetricsSource for HttpMetricsSource {
    async fn fetch(&self) -> Metrics {
        match self.try_fetch().await {
            Ok(metrics) => metrics,
            Err(err) => {
                tracing::error!(url = %self.url, error = %err, "metrics fetch failed, using defaults");
                Metrics::default()
            }
        }
    }
}

/// Fixed snapshot, for dry runs and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticMetrics(pub Metrics);

#[async_trait]
impl MetricsSource for StaticMetrics {
    async fn fetch(&self) -> Metrics {
        self.0
    }
}
