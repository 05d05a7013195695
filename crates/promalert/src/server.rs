//! HTTP server for Alertmanager webhooks.

use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{limit::RequestBodyLimitLayer, trace::TraceLayer};
use tracing::{debug, error, info, warn};

use crate::alert::{Alert, AlertmanagerPayload};
use crate::error::AlertError;
use crate::processor::{AlertProcessor, Outcome};

/// Largest accepted webhook body.
const MAX_BODY_BYTES: usize = 4 * 1024 * 1024;

/// Shared state of the HTTP handlers.
pub struct AppState {
    pub processor: Arc<AlertProcessor>,
    /// Log raw webhook bodies
    pub debug: bool,
}

/// Build the router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/webhook", post(webhook_handler))
        .route("/api/threads", get(threads_handler))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES)),
        )
        .with_state(state)
}

/// Start the HTTP server.
pub async fn run_server(state: Arc<AppState>, addr: &str) -> std::io::Result<()> {
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Promalert listening on {addr}");

    axum::serve(listener, app).await
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    message: &'static str,
}

async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse { message: "ok" })
}

/// Response for the webhook handler.
#[derive(Debug, Serialize)]
struct WebhookResponse {
    status: &'static str,
    alerts_processed: usize,
    threads_created: usize,
    thread_replies: usize,
    /// Resolved alerts posted without a thread to reply to
    unthreaded: usize,
    errors: Vec<String>,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    status: &'static str,
    error: String,
}

/// HTTP status for a failed batch: delivery failures are upstream failures.
fn failure_status(errors: &[AlertError]) -> StatusCode {
    if errors.iter().any(|e| matches!(e, AlertError::Delivery(_))) {
        StatusCode::BAD_GATEWAY
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    }
}

/// Alertmanager webhook handler.
async fn webhook_handler(State(state): State<Arc<AppState>>, body: Bytes) -> impl IntoResponse {
    if state.debug {
        debug!(body = %String::from_utf8_lossy(&body), "Webhook request");
    }

    let payload: AlertmanagerPayload = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(error = %e, "Rejected webhook payload");
            return (
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse {
                    status: "Invalid body of request",
                    error: e.to_string(),
                }),
            )
                .into_response();
        }
    };

    let alert_count = payload.alerts.len();
    info!(
        alerts = alert_count,
        status = %payload.status,
        group_key = %payload.group_key,
        "Received alert webhook"
    );

    let channel_override = payload.channel_override().map(ToString::to_string);
    let alerts: Vec<Alert> = payload
        .alerts
        .into_iter()
        .map(|a| Alert::from_webhook(a, channel_override.as_deref()))
        .collect();

    let results = join_all(alerts.iter().map(|alert| state.processor.process(alert))).await;

    let mut threads_created = 0;
    let mut thread_replies = 0;
    let mut unthreaded = 0;
    let mut failures = Vec::new();
    for (alert, result) in alerts.iter().zip(results) {
        match result {
            Ok(Outcome::ThreadCreated { .. }) => threads_created += 1,
            Ok(Outcome::ThreadReplied { .. }) => thread_replies += 1,
            Ok(Outcome::ResolvedUnthreaded { .. }) => unthreaded += 1,
            Err(e) => {
                error!(
                    alert = alert.name(),
                    identity = %alert.identity(),
                    kind = e.kind(),
                    error = %e,
                    "Failed to process alert"
                );
                failures.push((alert.name().to_string(), e));
            }
        }
    }

    let errors: Vec<String> = failures
        .iter()
        .map(|(name, e)| format!("{name}: {e}"))
        .collect();
    let (status_code, status) = if failures.is_empty() {
        (StatusCode::OK, "ok")
    } else {
        let errors: Vec<AlertError> = failures.into_iter().map(|(_, e)| e).collect();
        (failure_status(&errors), "error")
    };

    (
        status_code,
        Json(WebhookResponse {
            status,
            alerts_processed: alert_count,
            threads_created,
            thread_replies,
            unthreaded,
            errors,
        }),
    )
        .into_response()
}

#[derive(Debug, Serialize)]
struct ThreadsResponse {
    threads: usize,
}

/// Number of tracked threads.
async fn threads_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.processor.threads().len().await {
        Ok(threads) => (StatusCode::OK, Json(ThreadsResponse { threads })).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                status: "error",
                error: e.to_string(),
            }),
        )
            .into_response(),
    }
}
