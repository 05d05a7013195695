//! Time series returned by a range query, and selection of the series that
//! belongs to the alerting instance.

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info};

use crate::error::{QueryError, RenderError};

/// One point of a series, with the value exactly as the source reported it.
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesSample {
    pub timestamp: DateTime<Utc>,
    pub value: String,
}

/// A sample value read for drawing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SampleValue {
    Number(f64),
    /// No data at this point; lines break here
    Gap,
}

impl SeriesSample {
    pub fn new(timestamp: DateTime<Utc>, value: impl Into<String>) -> Self {
        Self {
            timestamp,
            value: value.into(),
        }
    }

    /// Read the value. `NaN` and infinities are gaps; any other non-number is
    /// an error.
    pub fn read(&self) -> Result<SampleValue, RenderError> {
        let parsed: f64 = self
            .value
            .trim()
            .parse()
            .map_err(|_| RenderError::InvalidSample {
                value: self.value.clone(),
            })?;

        if parsed.is_finite() {
            Ok(SampleValue::Number(parsed))
        } else {
            Ok(SampleValue::Gap)
        }
    }
}

/// A labelled sequence of samples.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Series {
    pub labels: BTreeMap<String, String>,
    pub samples: Vec<SeriesSample>,
}

impl Series {
    /// Label text used in chart legends: the label pairs without the metric name.
    #[must_use]
    pub fn legend_label(&self) -> String {
        self.labels
            .iter()
            .filter(|(key, _)| key.as_str() != "__name__")
            .map(|(key, value)| format!("{key}=\"{value}\""))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Whether the series belongs to an instance with `alert_labels`.
    ///
    /// Every label the two share must agree, and they must share at least one.
    #[must_use]
    pub fn matches(&self, alert_labels: &HashMap<String, String>) -> bool {
        let mut shared = 0;
        for (key, value) in &self.labels {
            match alert_labels.get(key) {
                Some(expected) if expected == value => shared += 1,
                Some(_) => return false,
                None => {}
            }
        }
        shared > 0
    }
}

/// Pick the series to chart for an alert.
///
/// The first matching series wins. Without a match the whole result set is
/// charted.
#[must_use]
pub fn select_series(series: Vec<Series>, alert_labels: &HashMap<String, String>) -> Vec<Series> {
    if let Some(index) = series.iter().position(|s| s.matches(alert_labels)) {
        debug!(labels = ?series[index].labels, "Best match found");
        let mut series = series;
        return vec![series.swap_remove(index)];
    }

    info!(
        series = series.len(),
        "Best match not found, using entire dataset"
    );
    series
}

/// A range query for one formula.
#[derive(Debug, Clone, PartialEq)]
pub struct RangeQuery {
    pub formula: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub step: TimeDelta,
}

/// Source of time series data.
#[async_trait]
pub trait SeriesSource: Send + Sync {
    /// Evaluate `query` over its range.
    async fn query_range(&self, query: &RangeQuery) -> Result<Vec<Series>, QueryError>;
}
