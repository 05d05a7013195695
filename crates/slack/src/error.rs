//! Error types for chat delivery.

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur when posting or updating a chat message.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// HTTP request failed
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Slack answered with `ok: false`
    #[error("Slack API error: {0}")]
    Api(String),

    /// Rate limited by the service
    #[error("Rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// Non-success HTTP status
    #[error("Slack returned status {status}: {body}")]
    Status { status: u16, body: String },

    /// The call did not finish in time
    #[error("Delivery timed out after {0:?}")]
    Timeout(Duration),
}

impl DeliveryError {
    /// Whether a retry has a chance of succeeding.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(e) => e.is_timeout() || e.is_connect(),
            Self::RateLimited { .. } | Self::Timeout(_) => true,
            Self::Status { status, .. } => *status >= 500,
            Self::Api(_) => false,
        }
    }

    /// Whether the request may have reached Slack even though it failed, so a
    /// repeat could post the message twice.
    #[must_use]
    pub fn may_have_been_delivered(&self) -> bool {
        match self {
            Self::Http(e) => e.is_timeout(),
            Self::Timeout(_) => true,
            Self::Api(_) | Self::RateLimited { .. } | Self::Status { .. } => false,
        }
    }
}
