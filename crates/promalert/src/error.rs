//! Error types for alert processing.

use std::time::Duration;
use thiserror::Error;

pub use slack::DeliveryError;

/// Errors from the series source.
#[derive(Debug, Error)]
pub enum QueryError {
    /// HTTP request failed
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Non-success HTTP status
    #[error("Prometheus returned status {status}: {body}")]
    Status { status: u16, body: String },

    /// Response body did not have the expected shape
    #[error("Failed to decode query response: {0}")]
    Decode(String),

    /// Prometheus answered with `status: error`
    #[error("Prometheus query failed ({error_type}): {error}")]
    Prometheus { error_type: String, error: String },

    /// The query did not finish in time
    #[error("Query timed out after {0:?}")]
    Timeout(Duration),
}

/// Errors while drawing a chart.
#[derive(Debug, Error)]
pub enum RenderError {
    /// No usable font could be loaded
    #[error("Font initialization failed: {0}")]
    Font(String),

    /// Canvas or drawing failure
    #[error("Drawing failed: {0}")]
    Draw(String),

    /// PNG encoding failure
    #[error("Image encoding failed: {0}")]
    Encode(String),

    /// A sample value that is neither a number nor a gap
    #[error("Invalid sample value {value:?}")]
    InvalidSample { value: String },

    /// The blocking render task died
    #[error("Render task failed: {0}")]
    Join(String),
}

/// Errors while uploading a chart.
#[derive(Debug, Error)]
pub enum UploadError {
    /// Object store failure
    #[error("Object store error: {0}")]
    Store(#[from] object_store::Error),

    /// The upload did not finish in time
    #[error("Upload timed out after {0:?}")]
    Timeout(Duration),
}

/// Errors from the thread state backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Thread store backend error: {0}")]
    Backend(String),
}

/// Errors from message templates.
#[derive(Debug, Error)]
pub enum TemplateError {
    /// Template failed to compile
    #[error("Invalid template {name}: {source}")]
    Compile {
        name: &'static str,
        #[source]
        source: Box<handlebars::TemplateError>,
    },

    /// Template failed to render
    #[error("Template rendering failed: {0}")]
    Render(#[from] handlebars::RenderError),
}

/// Everything that can abort the processing of one alert.
#[derive(Debug, Error)]
pub enum AlertError {
    #[error(transparent)]
    Query(#[from] QueryError),

    #[error(transparent)]
    Render(#[from] RenderError),

    #[error(transparent)]
    Upload(#[from] UploadError),

    #[error(transparent)]
    Delivery(#[from] DeliveryError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Template(#[from] TemplateError),
}

impl AlertError {
    /// Short name of the failing stage, used as a log field.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Query(_) => "query",
            Self::Render(_) => "render",
            Self::Upload(_) => "upload",
            Self::Delivery(_) => "delivery",
            Self::Store(_) => "store",
            Self::Template(_) => "template",
        }
    }
}

/// Errors of external calls that can be retried and bounded in time.
pub trait Transient: Sized {
    /// Whether a retry has a chance of succeeding.
    fn is_transient(&self) -> bool;

    /// The error reported when a call exceeds its time limit.
    fn timed_out(after: Duration) -> Self;
}

impl Transient for QueryError {
    fn is_transient(&self) -> bool {
        match self {
            Self::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            Self::Status { status, .. } => *status >= 500 || *status == 429,
            Self::Timeout(_) => true,
            Self::Decode(_) | Self::Prometheus { .. } => false,
        }
    }

    fn timed_out(after: Duration) -> Self {
        Self::Timeout(after)
    }
}

impl Transient for UploadError {
    fn is_transient(&self) -> bool {
        match self {
            Self::Store(e) => matches!(e, object_store::Error::Generic { .. }),
            Self::Timeout(_) => true,
        }
    }

    fn timed_out(after: Duration) -> Self {
        Self::Timeout(after)
    }
}

impl Transient for DeliveryError {
    fn is_transient(&self) -> bool {
        DeliveryError::is_transient(self)
    }

    fn timed_out(after: Duration) -> Self {
        Self::Timeout(after)
    }
}
