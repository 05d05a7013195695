//! Prometheus HTTP API client.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

use crate::error::QueryError;
use crate::series::{RangeQuery, Series, SeriesSample, SeriesSource};

/// Default Prometheus address
pub const DEFAULT_PROMETHEUS_URL: &str = "http://localhost:9090";

/// Configuration for the Prometheus client
#[derive(Debug, Clone)]
pub struct PrometheusConfig {
    /// Base URL for the Prometheus API
    pub base_url: String,
    /// Request timeout
    pub timeout: Duration,
}

impl Default for PrometheusConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_PROMETHEUS_URL.to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Prometheus query response
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PrometheusResponse {
    status: String,
    #[serde(default)]
    data: Option<PrometheusData>,
    #[serde(default)]
    error_type: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PrometheusData {
    #[serde(rename = "resultType")]
    result_type: String,
    result: Vec<PrometheusResult>,
}

#[derive(Debug, Deserialize)]
struct PrometheusResult {
    #[serde(default)]
    metric: BTreeMap<String, String>,
    #[serde(default)]
    values: Vec<(f64, String)>,
}

/// Prometheus client for range queries
#[derive(Debug, Clone)]
pub struct PrometheusClient {
    config: PrometheusConfig,
    client: reqwest::Client,
}

impl PrometheusClient {
    /// Create a new Prometheus client with the given configuration.
    pub fn new(config: PrometheusConfig) -> Result<Self, QueryError> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self { config, client })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{path}", self.config.base_url.trim_end_matches('/'))
    }

    /// Check if Prometheus is reachable.
    pub async fn health_check(&self) -> bool {
        match self.client.get(self.endpoint("/-/healthy")).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }
}

fn sample_time(seconds: f64) -> Result<DateTime<Utc>, QueryError> {
    DateTime::from_timestamp_millis((seconds * 1000.0).round() as i64)
        .ok_or_else(|| QueryError::Decode(format!("timestamp out of range: {seconds}")))
}

#[async_trait]
impl SeriesSource for PrometheusClient {
    async fn query_range(&self, query: &RangeQuery) -> Result<Vec<Series>, QueryError> {
        debug!(
            formula = %query.formula,
            start = %query.start,
            end = %query.end,
            step_secs = query.step.num_seconds(),
            "Executing Prometheus range query"
        );

        let response = self
            .client
            .get(self.endpoint("/api/v1/query_range"))
            .query(&[
                ("query", query.formula.clone()),
                ("start", query.start.timestamp().to_string()),
                ("end", query.end.timestamp().to_string()),
                ("step", query.step.num_seconds().max(1).to_string()),
            ])
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        // Error responses carry a JSON body with 4xx/5xx statuses too.
        let parsed = serde_json::from_str::<PrometheusResponse>(&body);
        let prom_response = match parsed {
            Ok(r) if r.status == "error" => {
                return Err(QueryError::Prometheus {
                    error_type: r.error_type.unwrap_or_default(),
                    error: r.error.unwrap_or_default(),
                });
            }
            _ if !status.is_success() => {
                return Err(QueryError::Status {
                    status: status.as_u16(),
                    body,
                });
            }
            Ok(r) => r,
            Err(e) => return Err(QueryError::Decode(e.to_string())),
        };

        let data = prom_response
            .data
            .ok_or_else(|| QueryError::Decode("response has no data".to_string()))?;
        if data.result_type != "matrix" {
            return Err(QueryError::Decode(format!(
                "unsupported result type: {}",
                data.result_type
            )));
        }

        data.result
            .into_iter()
            .map(|result| {
                let samples = result
                    .values
                    .into_iter()
                    .map(|(t, v)| Ok(SeriesSample::new(sample_time(t)?, v)))
                    .collect::<Result<Vec<_>, QueryError>>()?;
                Ok(Series {
                    labels: result.metric,
                    samples,
                })
            })
            .collect()
    }
}
