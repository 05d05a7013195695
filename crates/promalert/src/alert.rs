//! Alertmanager webhook payload and the per-alert model built from it.

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use url::Url;

use crate::identity;

/// Query parameter of `generatorURL` that carries the alerting expression.
const GENERATOR_EXPR_PARAM: &str = "g0.expr";

/// Alertmanager webhook payload.
///
/// Reference: <https://prometheus.io/docs/alerting/latest/configuration/#webhook_config>
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertmanagerPayload {
    /// Version of the payload format
    #[serde(default)]
    pub version: String,
    /// Unique identifier for this group of alerts
    #[serde(default)]
    pub group_key: String,
    /// Status of the group
    pub status: AlertStatus,
    /// Receiver that matched this alert
    #[serde(default)]
    pub receiver: String,
    /// Labels common to all alerts in this group
    #[serde(default)]
    pub group_labels: HashMap<String, String>,
    /// Labels common to all alerts (may include group labels)
    #[serde(default)]
    pub common_labels: HashMap<String, String>,
    /// Annotations common to all alerts
    #[serde(default)]
    pub common_annotations: HashMap<String, String>,
    /// External URL for Alertmanager
    #[serde(default, rename = "externalURL")]
    pub external_url: String,
    /// List of alerts in this notification
    pub alerts: Vec<AlertmanagerAlert>,
}

impl AlertmanagerPayload {
    /// Channel requested by the rule through a `channel` common label.
    #[must_use]
    pub fn channel_override(&self) -> Option<&str> {
        self.common_labels
            .get("channel")
            .map(String::as_str)
            .filter(|c| !c.is_empty())
    }
}

/// Individual alert from Alertmanager.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertmanagerAlert {
    /// Firing or resolved
    pub status: AlertStatus,
    /// Alert labels
    #[serde(default)]
    pub labels: HashMap<String, String>,
    /// Alert annotations
    #[serde(default)]
    pub annotations: HashMap<String, String>,
    /// When the alert started firing
    pub starts_at: DateTime<Utc>,
    /// When the alert ended (or is expected to end)
    #[serde(default)]
    pub ends_at: Option<DateTime<Utc>>,
    /// Link back to the rule's expression in Prometheus
    #[serde(default, rename = "generatorURL")]
    pub generator_url: String,
    /// Alertmanager's own fingerprint
    #[serde(default)]
    pub fingerprint: String,
}

/// Alert status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Firing,
    Resolved,
}

impl AlertStatus {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Firing => "firing",
            Self::Resolved => "resolved",
        }
    }
}

impl std::fmt::Display for AlertStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity taken from the `severity` label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Warn,
    Critical,
    Page,
    /// Missing or unrecognised severity
    Unknown,
}

/// Attachment color for resolved alerts.
pub const RESOLVED_COLOR: &str = "#8cc63f";

impl Severity {
    /// Parse a severity label value.
    #[must_use]
    pub fn from_label(value: Option<&str>) -> Self {
        match value {
            Some("warn") => Self::Warn,
            Some("critical") => Self::Critical,
            Some("page") => Self::Page,
            _ => Self::Unknown,
        }
    }

    /// Attachment side-bar color, if the severity has one.
    #[must_use]
    pub const fn color(&self) -> Option<&'static str> {
        match self {
            Self::Warn => Some("#ffa300"),     // sunflower
            Self::Critical => Some("#ff5a60"), // coral
            Self::Page => Some("#a15fff"),     // orchid
            Self::Unknown => None,
        }
    }
}

/// A single alert event as the processor sees it.
#[derive(Debug, Clone)]
pub struct Alert {
    pub status: AlertStatus,
    pub labels: HashMap<String, String>,
    pub annotations: HashMap<String, String>,
    pub starts_at: DateTime<Utc>,
    pub ends_at: Option<DateTime<Utc>>,
    pub generator_url: String,
    /// Fingerprint reported by Alertmanager; informational only
    pub fingerprint: String,
    /// Channel for a new thread when the rule asks for one
    pub channel_override: Option<String>,
}

impl Alert {
    /// Build from a webhook alert, carrying the payload-level channel override.
    ///
    /// Alertmanager encodes "no end" as the zero time `0001-01-01T00:00:00Z`;
    /// that is normalised to `None`.
    #[must_use]
    pub fn from_webhook(alert: AlertmanagerAlert, channel_override: Option<&str>) -> Self {
        Self {
            status: alert.status,
            labels: alert.labels,
            annotations: alert.annotations,
            starts_at: alert.starts_at,
            ends_at: alert.ends_at.filter(|t| t.year() > 1),
            generator_url: alert.generator_url,
            fingerprint: alert.fingerprint,
            channel_override: channel_override.map(ToString::to_string),
        }
    }

    /// Get the alert name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.labels.get("alertname").map_or("unknown", String::as_str)
    }

    /// Stable dedup identity derived from the label set.
    #[must_use]
    pub fn identity(&self) -> String {
        identity::fingerprint(&self.labels)
    }

    #[must_use]
    pub fn severity(&self) -> Severity {
        Severity::from_label(self.labels.get("severity").map(String::as_str))
    }

    #[must_use]
    pub fn is_firing(&self) -> bool {
        self.status == AlertStatus::Firing
    }

    /// The alerting expression carried in `generatorURL`, or empty when absent.
    #[must_use]
    pub fn generator_query(&self) -> String {
        Url::parse(&self.generator_url)
            .ok()
            .and_then(|url| {
                url.query_pairs()
                    .find(|(key, _)| key == GENERATOR_EXPR_PARAM)
                    .map(|(_, value)| value.into_owned())
            })
            .unwrap_or_default()
    }
}
