//! Service configuration.
//!
//! Read from a YAML file, then overridden by `PROMALERT_<FIELD>` environment
//! variables. The file is either given explicitly or the first `config.yaml`
//! found in [`SEARCH_DIRS`].

use chrono::TimeDelta;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

use crate::compose::{DEFAULT_FOOTER_TEMPLATE, DEFAULT_HEADER_TEMPLATE, DEFAULT_MESSAGE_TEMPLATE};
use crate::prometheus::DEFAULT_PROMETHEUS_URL;
use crate::retry::RetryConfig;

/// Directories searched for `config.yaml`, in order.
pub const SEARCH_DIRS: &[&str] = &[".", "/app", "/etc/promalert"];

const CONFIG_FILE_NAME: &str = "config.yaml";
const ENV_PREFIX: &str = "PROMALERT_";

/// Accepted chart size multipliers.
pub const GRAPH_SCALE_RANGE: (f64, f64) = (0.1, 10.0);

/// Errors while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("Invalid value for {var}: {value:?}")]
    InvalidEnv { var: String, value: String },

    #[error("Missing required setting: {0}")]
    Missing(&'static str),

    #[error("{field} must be within {min}..={max}, got {value}")]
    OutOfRange {
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },
}

/// Service configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Address the HTTP server binds to
    pub listen_addr: String,
    pub prometheus_url: String,
    /// Points per chart
    pub metric_resolution: u32,
    pub slack_token: String,
    /// Channel for new threads when the rule names none
    pub slack_channel: String,
    pub slack_api_url: String,
    pub s3_bucket: String,
    pub s3_region: String,
    /// Endpoint of an S3-compatible store
    pub s3_endpoint: Option<String>,
    /// Base of chart URLs; derived from the bucket when unset
    pub public_url_base: Option<String>,
    /// Chart size multiplier
    pub graph_scale: f64,
    pub font_path: Option<PathBuf>,
    pub header_template: String,
    pub message_template: String,
    /// Empty disables the footer
    pub footer_template: String,
    pub call_timeout_secs: u64,
    pub retry: RetryConfig,
    /// Forget threads not updated for this long; kept forever when unset
    pub thread_retention_hours: Option<u64>,
    /// Log request bodies
    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
            prometheus_url: DEFAULT_PROMETHEUS_URL.to_string(),
            metric_resolution: 100,
            slack_token: String::new(),
            slack_channel: String::new(),
            slack_api_url: slack::client::DEFAULT_API_URL.to_string(),
            s3_bucket: String::new(),
            s3_region: "us-east-1".to_string(),
            s3_endpoint: None,
            public_url_base: None,
            graph_scale: 1.0,
            font_path: None,
            header_template: DEFAULT_HEADER_TEMPLATE.to_string(),
            message_template: DEFAULT_MESSAGE_TEMPLATE.to_string(),
            footer_template: DEFAULT_FOOTER_TEMPLATE.to_string(),
            call_timeout_secs: 30,
            retry: RetryConfig::default(),
            thread_retention_hours: None,
            debug: false,
        }
    }
}

fn parse_env<T: FromStr>(var: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        var: var.to_string(),
        value: value.to_string(),
    })
}

fn non_empty(value: String) -> Option<String> {
    Some(value).filter(|v| !v.is_empty())
}

impl Config {
    /// Load from `explicit`, or from the first `config.yaml` in [`SEARCH_DIRS`],
    /// then apply environment overrides.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let path = explicit.map(Path::to_path_buf).or_else(Self::find_config_file);

        let mut config = match &path {
            Some(path) => Self::from_file(path)?,
            None => {
                info!("No config file found, using defaults");
                Self::default()
            }
        };

        config.apply_env(|var| std::env::var(var).ok())?;
        Ok(config)
    }

    /// First `config.yaml` found in [`SEARCH_DIRS`].
    #[must_use]
    pub fn find_config_file() -> Option<PathBuf> {
        SEARCH_DIRS
            .iter()
            .map(|dir| Path::new(dir).join(CONFIG_FILE_NAME))
            .find(|path| path.is_file())
    }

    /// Parse a YAML config file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        info!(path = %path.display(), "Loaded config file");

        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply `PROMALERT_<FIELD>` overrides read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |field: &str| {
            let var = format!("{ENV_PREFIX}{}", field.to_uppercase());
            lookup(&var).map(|value| {
                debug!(var = %var, "Config override from environment");
                (var, value)
            })
        };

        if let Some((_, v)) = get("listen_addr") {
            self.listen_addr = v;
        }
        if let Some((_, v)) = get("prometheus_url") {
            self.prometheus_url = v;
        }
        if let Some((var, v)) = get("metric_resolution") {
            self.metric_resolution = parse_env(&var, &v)?;
        }
        if let Some((_, v)) = get("slack_token") {
            self.slack_token = v;
        }
        if let Some((_, v)) = get("slack_channel") {
            self.slack_channel = v;
        }
        if let Some((_, v)) = get("slack_api_url") {
            self.slack_api_url = v;
        }
        if let Some((_, v)) = get("s3_bucket") {
            self.s3_bucket = v;
        }
        if let Some((_, v)) = get("s3_region") {
            self.s3_region = v;
        }
        if let Some((_, v)) = get("s3_endpoint") {
            self.s3_endpoint = non_empty(v);
        }
        if let Some((_, v)) = get("public_url_base") {
            self.public_url_base = non_empty(v);
        }
        if let Some((var, v)) = get("graph_scale") {
            self.graph_scale = parse_env(&var, &v)?;
        }
        if let Some((_, v)) = get("font_path") {
            self.font_path = non_empty(v).map(PathBuf::from);
        }
        if let Some((_, v)) = get("header_template") {
            self.header_template = v;
        }
        if let Some((_, v)) = get("message_template") {
            self.message_template = v;
        }
        if let Some((_, v)) = get("footer_template") {
            self.footer_template = v;
        }
        if let Some((var, v)) = get("call_timeout_secs") {
            self.call_timeout_secs = parse_env(&var, &v)?;
        }
        if let Some((var, v)) = get("retry_max_attempts") {
            self.retry.max_attempts = parse_env(&var, &v)?;
        }
        if let Some((var, v)) = get("thread_retention_hours") {
            self.thread_retention_hours = match non_empty(v) {
                Some(v) => Some(parse_env(&var, &v)?),
                None => None,
            };
        }
        if let Some((var, v)) = get("debug") {
            self.debug = parse_env(&var, &v.to_lowercase())?;
        }

        Ok(())
    }

    /// Check the settings the service cannot run without.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.slack_token.is_empty() {
            return Err(ConfigError::Missing("slack_token"));
        }
        if self.slack_channel.is_empty() {
            return Err(ConfigError::Missing("slack_channel"));
        }
        if self.s3_bucket.is_empty() {
            return Err(ConfigError::Missing("s3_bucket"));
        }
        let (min, max) = GRAPH_SCALE_RANGE;
        if !(min..=max).contains(&self.graph_scale) {
            return Err(ConfigError::OutOfRange {
                field: "graph_scale",
                value: self.graph_scale,
                min,
                max,
            });
        }
        Ok(())
    }

    /// Base of public chart URLs.
    #[must_use]
    pub fn public_url_base(&self) -> String {
        self.public_url_base
            .clone()
            .unwrap_or_else(|| format!("https://s3.amazonaws.com/{}", self.s3_bucket))
    }

    #[must_use]
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs.max(1))
    }

    #[must_use]
    pub fn thread_retention(&self) -> Option<TimeDelta> {
        self.thread_retention_hours
            .and_then(|h| TimeDelta::try_hours(i64::try_from(h).ok()?))
    }
}
