//! End-to-end tests for the webhook flow.
//!
//! The router runs against in-process fakes for Prometheus and Slack and an
//! in-memory object store, so every message the service sends can be inspected.

use async_trait::async_trait;
use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use object_store::memory::InMemory;
use promalert::chart::ChartRenderer;
use promalert::compose::{
    MessageComposer, DEFAULT_FOOTER_TEMPLATE, DEFAULT_HEADER_TEMPLATE, DEFAULT_MESSAGE_TEMPLATE,
};
use promalert::error::{QueryError, UploadError};
use promalert::retry::{RetryConfig, RetryPolicy};
use promalert::series::{RangeQuery, Series, SeriesSample, SeriesSource};
use promalert::thread_store::InMemoryThreadStore;
use promalert::upload::{ChartStore, ObjectStoreUploader};
use promalert::{build_router, AlertProcessor, AppState, Collaborators, ProcessorSettings};
use serde_json::{json, Value};
use slack::{Block, ChatClient, DeliveryError, OutgoingMessage, PostedMessage};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tower::ServiceExt;

// =============================================================================
// Fakes
// =============================================================================

/// A message the fake chat received.
#[derive(Debug, Clone)]
struct Recorded {
    ts: Option<String>,
    message: OutgoingMessage,
}

/// Chat backend that records posts and updates.
#[derive(Default)]
struct FakeChat {
    posts: Mutex<Vec<Recorded>>,
    updates: Mutex<Vec<Recorded>>,
    counter: AtomicUsize,
    attempts: AtomicUsize,
    /// Posts still to fail with a timeout
    timeouts: AtomicUsize,
    fail_posts: bool,
}

impl FakeChat {
    fn failing() -> Self {
        Self {
            fail_posts: true,
            ..Self::default()
        }
    }

    fn time_out_next_posts(&self, count: usize) {
        self.timeouts.store(count, Ordering::SeqCst);
    }

    fn posts(&self) -> Vec<Recorded> {
        self.posts.lock().unwrap().clone()
    }

    fn updates(&self) -> Vec<Recorded> {
        self.updates.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatClient for FakeChat {
    async fn post_message(&self, message: &OutgoingMessage) -> Result<PostedMessage, DeliveryError> {
        // Widen the window in which two concurrent firings could race.
        tokio::time::sleep(Duration::from_millis(10)).await;
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let timed_out = self
            .timeouts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if timed_out {
            return Err(DeliveryError::Timeout(Duration::from_secs(5)));
        }
        if self.fail_posts {
            return Err(DeliveryError::Api("channel_not_found".into()));
        }

        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let ts = format!("1700000000.{n:06}");
        self.posts.lock().unwrap().push(Recorded {
            ts: Some(ts.clone()),
            message: message.clone(),
        });
        Ok(PostedMessage {
            channel: message.channel.clone(),
            ts,
        })
    }

    async fn update_message(
        &self,
        ts: &str,
        message: &OutgoingMessage,
    ) -> Result<PostedMessage, DeliveryError> {
        self.updates.lock().unwrap().push(Recorded {
            ts: Some(ts.to_string()),
            message: message.clone(),
        });
        Ok(PostedMessage {
            channel: message.channel.clone(),
            ts: ts.to_string(),
        })
    }
}

/// Series source answering every query with one fixed series.
#[derive(Default)]
struct FakeSeries {
    queries: Mutex<Vec<String>>,
    /// Formula whose query fails; `"*"` fails every query
    fail_formula: Option<&'static str>,
}

impl FakeSeries {
    fn failing_on(formula: &'static str) -> Self {
        Self {
            fail_formula: Some(formula),
            ..Self::default()
        }
    }
}

#[async_trait]
impl SeriesSource for FakeSeries {
    async fn query_range(&self, query: &RangeQuery) -> Result<Vec<Series>, QueryError> {
        self.queries.lock().unwrap().push(query.formula.clone());
        if self
            .fail_formula
            .is_some_and(|f| f == "*" || f == query.formula)
        {
            return Err(QueryError::Prometheus {
                error_type: "bad_data".into(),
                error: "parse error".into(),
            });
        }

        let samples = (0..10)
            .map(|i| {
                SeriesSample::new(
                    query.start + TimeDelta::minutes(i * 2),
                    format!("{}", 0.5 + i as f64 * 0.1),
                )
            })
            .collect();
        Ok(vec![Series {
            labels: [("instance".to_string(), "web-1".to_string())]
                .into_iter()
                .collect(),
            samples,
        }])
    }
}

/// Chart store that always fails.
struct BrokenStore;

#[async_trait]
impl ChartStore for BrokenStore {
    async fn upload(&self, _png: Vec<u8>) -> Result<String, UploadError> {
        Err(UploadError::Store(object_store::Error::NotImplemented))
    }
}

// =============================================================================
// Harness
// =============================================================================

struct Harness {
    router: Router,
    chat: Arc<FakeChat>,
    series: Arc<FakeSeries>,
}

fn harness_with(chat: FakeChat, series: FakeSeries, charts: Arc<dyn ChartStore>) -> Harness {
    harness_with_retry(
        chat,
        series,
        charts,
        RetryPolicy::no_retry(Duration::from_secs(5)),
    )
}

fn harness_with_retry(
    chat: FakeChat,
    series: FakeSeries,
    charts: Arc<dyn ChartStore>,
    retry: RetryPolicy,
) -> Harness {
    let chat = Arc::new(chat);
    let series = Arc::new(series);
    let processor = AlertProcessor::new(
        Collaborators {
            series: series.clone(),
            charts,
            chat: chat.clone(),
            threads: Arc::new(InMemoryThreadStore::new(None)),
        },
        MessageComposer::new(
            DEFAULT_HEADER_TEMPLATE,
            DEFAULT_MESSAGE_TEMPLATE,
            DEFAULT_FOOTER_TEMPLATE,
        )
        .unwrap(),
        ChartRenderer::default(),
        ProcessorSettings {
            default_channel: "#alerts".to_string(),
            metric_resolution: 50,
            retry,
        },
    );

    let router = build_router(Arc::new(AppState {
        processor: Arc::new(processor),
        debug: true,
    }));

    Harness {
        router,
        chat,
        series,
    }
}

fn memory_store() -> Arc<dyn ChartStore> {
    Arc::new(ObjectStoreUploader::new(
        Arc::new(InMemory::new()),
        "https://charts.example.com",
    ))
}

fn harness() -> Harness {
    harness_with(FakeChat::default(), FakeSeries::default(), memory_store())
}

fn retrying() -> RetryPolicy {
    RetryPolicy::new(
        &RetryConfig {
            max_attempts: 3,
            initial_delay_ms: 1,
            max_delay_ms: 5,
            backoff_multiplier: 2.0,
        },
        Duration::from_secs(5),
    )
}

fn starts_at() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap()
}

fn generator_url(expr: &str) -> String {
    let mut url = url::Url::parse("http://prometheus:9090/graph").unwrap();
    url.query_pairs_mut()
        .append_pair("g0.expr", expr)
        .append_pair("g0.tab", "1");
    url.to_string()
}

fn alert_json(status: &str, expr: &str) -> Value {
    let ends_at = if status == "resolved" {
        "2024-03-01T10:30:00Z"
    } else {
        "0001-01-01T00:00:00Z"
    };
    json!({
        "status": status,
        "labels": {
            "alertname": "HighLatency",
            "instance": "web-1",
            "severity": "critical"
        },
        "annotations": { "summary": "p99 latency above 500ms" },
        "startsAt": starts_at().to_rfc3339(),
        "endsAt": ends_at,
        "generatorURL": generator_url(expr),
        "fingerprint": "6a3f1c0d"
    })
}

fn payload(status: &str, alerts: Vec<Value>) -> Value {
    json!({
        "version": "4",
        "groupKey": "{}:{alertname=\"HighLatency\"}",
        "status": status,
        "receiver": "slack",
        "alerts": alerts
    })
}

async fn send(router: &Router, body: String) -> (StatusCode, Value) {
    let request = Request::builder()
        .method("POST")
        .uri("/webhook")
        .header("content-type", "application/json")
        .body(Body::from(body))
        .unwrap();
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

async fn send_payload(router: &Router, payload: &Value) -> (StatusCode, Value) {
    send(router, payload.to_string()).await
}

fn image_titles(blocks: &[Block]) -> Vec<String> {
    blocks
        .iter()
        .filter_map(|block| match block {
            Block::Image { title, .. } => title.as_ref().map(|t| t.text().to_string()),
            _ => None,
        })
        .collect()
}

// An expression without a threshold comparison produces no charts.
const NO_CHART_EXPR: &str = "absent(up{job=\"api\"})";

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn test_health_endpoint() {
    let h = harness();
    let request = Request::builder()
        .uri("/healthz")
        .body(Body::empty())
        .unwrap();
    let response = h.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body, json!({ "message": "ok" }));
}

#[tokio::test]
async fn test_malformed_body_rejected() {
    let h = harness();
    let (status, body) = send(&h.router, "{not json".to_string()).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["status"], "Invalid body of request");
    assert!(h.chat.posts().is_empty());
}

#[tokio::test]
async fn test_firing_then_resolved_threads_messages() {
    let h = harness();

    let (status, body) = send_payload(
        &h.router,
        &payload("firing", vec![alert_json("firing", NO_CHART_EXPR)]),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["threads_created"], 1);

    let (status, body) = send_payload(
        &h.router,
        &payload("resolved", vec![alert_json("resolved", NO_CHART_EXPR)]),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["thread_replies"], 1);

    let posts = h.chat.posts();
    assert_eq!(posts.len(), 2);

    let root = &posts[0];
    assert_eq!(root.message.channel, "#alerts");
    assert_eq!(root.message.thread_ts, None);
    assert_eq!(root.message.color.as_deref(), Some("#ff5a60"));

    let reply = &posts[1];
    assert_eq!(reply.message.thread_ts, root.ts);
    assert!(reply.message.broadcast);
    assert_eq!(reply.message.color.as_deref(), Some(promalert::alert::RESOLVED_COLOR));
    // The resolved reply is the short form: header only.
    assert_eq!(reply.message.blocks.len(), 1);

    // Resolution appends a footer to the thread's top-level message.
    let updates = h.chat.updates();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].ts, root.ts);
    let last = updates[0].message.blocks.last().unwrap();
    assert!(matches!(last, Block::Context { .. }));
    assert_eq!(
        updates[0].message.blocks.len(),
        root.message.blocks.len() + 1
    );

    let request = Request::builder()
        .uri("/api/threads")
        .body(Body::empty())
        .unwrap();
    let response = h.router.clone().oneshot(request).await.unwrap();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["threads"], 1);
}

#[tokio::test]
async fn test_resolved_without_thread_posts_alone() {
    let h = harness();

    let (status, body) = send_payload(
        &h.router,
        &payload("resolved", vec![alert_json("resolved", NO_CHART_EXPR)]),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["unthreaded"], 1);
    assert_eq!(body["threads_created"], 0);

    let posts = h.chat.posts();
    assert_eq!(posts.len(), 1);
    assert_eq!(posts[0].message.thread_ts, None);
    assert!(h.chat.updates().is_empty());

    // Nothing is remembered, so a later firing starts a fresh thread.
    send_payload(
        &h.router,
        &payload("firing", vec![alert_json("firing", NO_CHART_EXPR)]),
    )
    .await;
    let posts = h.chat.posts();
    assert_eq!(posts.len(), 2);
    assert_eq!(posts[1].message.thread_ts, None);
}

#[tokio::test]
async fn test_concurrent_firings_share_one_thread() {
    let h = harness();
    let body = payload("firing", vec![alert_json("firing", NO_CHART_EXPR)]).to_string();

    let (first, second) = tokio::join!(send(&h.router, body.clone()), send(&h.router, body));
    assert_eq!(first.0, StatusCode::OK);
    assert_eq!(second.0, StatusCode::OK);

    let posts = h.chat.posts();
    assert_eq!(posts.len(), 2);
    let top_level: Vec<_> = posts
        .iter()
        .filter(|p| p.message.thread_ts.is_none())
        .collect();
    assert_eq!(top_level.len(), 1);
    let reply = posts
        .iter()
        .find(|p| p.message.thread_ts.is_some())
        .unwrap();
    assert_eq!(reply.message.thread_ts, top_level[0].ts);
}

#[tokio::test]
async fn test_same_identity_in_one_payload_shares_thread() {
    let h = harness();
    let (status, body) = send_payload(
        &h.router,
        &payload(
            "firing",
            vec![
                alert_json("firing", NO_CHART_EXPR),
                alert_json("firing", NO_CHART_EXPR),
            ],
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["alerts_processed"], 2);
    assert_eq!(body["threads_created"], 1);
    assert_eq!(body["thread_replies"], 1);
}

#[tokio::test]
async fn test_channel_override_from_common_labels() {
    let h = harness();
    let mut body = payload("firing", vec![alert_json("firing", NO_CHART_EXPR)]);
    body["commonLabels"] = json!({ "channel": "#team-api" });

    let (status, _) = send_payload(&h.router, &body).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(h.chat.posts()[0].message.channel, "#team-api");
}

#[tokio::test]
async fn test_no_comparison_means_no_images() {
    let h = harness();
    send_payload(
        &h.router,
        &payload("firing", vec![alert_json("firing", NO_CHART_EXPR)]),
    )
    .await;

    let posts = h.chat.posts();
    assert!(image_titles(&posts[0].message.blocks).is_empty());
    assert!(h.series.queries.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_query_failure_aborts_without_posting() {
    let h = harness_with(
        FakeChat::default(),
        FakeSeries::failing_on("*"),
        Arc::new(BrokenStore),
    );

    let (status, body) = send_payload(
        &h.router,
        &payload(
            "firing",
            vec![alert_json("firing", "histogram_quantile(0.99, rate(x[5m])) > 0.5")],
        ),
    )
    .await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["status"], "error");
    assert_eq!(body["errors"].as_array().unwrap().len(), 1);
    assert!(h.chat.posts().is_empty());
}

#[tokio::test]
async fn test_delivery_failure_is_bad_gateway() {
    let h = harness_with(
        FakeChat::failing(),
        FakeSeries::default(),
        Arc::new(BrokenStore),
    );

    let (status, _) = send_payload(
        &h.router,
        &payload("firing", vec![alert_json("firing", NO_CHART_EXPR)]),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn test_images_follow_decomposition_order() {
    let h = harness();

    let (status, _) = send_payload(
        &h.router,
        &payload(
            "firing",
            vec![alert_json(
                "firing",
                "rate(errors_total[5m]) > 0.5 and rate(requests_total[5m]) < 100",
            )],
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let posts = h.chat.posts();
    assert_eq!(
        image_titles(&posts[0].message.blocks),
        vec![
            "rate(errors_total[5m]) > 0.50".to_string(),
            "rate(requests_total[5m]) < 100.00".to_string(),
        ]
    );

    let urls: Vec<_> = posts[0]
        .message
        .blocks
        .iter()
        .filter_map(|block| match block {
            Block::Image { image_url, .. } => Some(image_url.clone()),
            _ => None,
        })
        .collect();
    assert!(urls
        .iter()
        .all(|u| u.starts_with("https://charts.example.com/pictures/")));
}

#[tokio::test]
async fn test_upload_failure_aborts_without_posting() {
    let h = harness_with(
        FakeChat::default(),
        FakeSeries::default(),
        Arc::new(BrokenStore),
    );

    let (status, _) = send_payload(
        &h.router,
        &payload("firing", vec![alert_json("firing", "up{job=\"api\"} < 1")]),
    )
    .await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(h.chat.posts().is_empty());
}

#[tokio::test]
async fn test_second_chart_failure_posts_no_partial_set() {
    let h = harness_with(
        FakeChat::default(),
        FakeSeries::failing_on("rate(requests_total[5m])"),
        memory_store(),
    );

    let (status, body) = send_payload(
        &h.router,
        &payload(
            "firing",
            vec![alert_json(
                "firing",
                "rate(errors_total[5m]) > 0.5 and rate(requests_total[5m]) < 100",
            )],
        ),
    )
    .await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["errors"].as_array().unwrap().len(), 1);
    let queries = h.series.queries.lock().unwrap().clone();
    assert!(queries.contains(&"rate(errors_total[5m])".to_string()));
    assert!(h.chat.posts().is_empty());
    assert_eq!(body["threads_created"], 0);
}

#[tokio::test]
async fn test_top_level_post_not_repeated_after_timeout() {
    let h = harness_with_retry(
        FakeChat::default(),
        FakeSeries::default(),
        memory_store(),
        retrying(),
    );
    h.chat.time_out_next_posts(1);

    let (status, _) = send_payload(
        &h.router,
        &payload("firing", vec![alert_json("firing", NO_CHART_EXPR)]),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(h.chat.attempts.load(Ordering::SeqCst), 1);
    assert!(h.chat.posts().is_empty());
}

#[tokio::test]
async fn test_thread_reply_retried_after_timeout() {
    let h = harness_with_retry(
        FakeChat::default(),
        FakeSeries::default(),
        memory_store(),
        retrying(),
    );
    let body = payload("firing", vec![alert_json("firing", NO_CHART_EXPR)]);

    let (status, _) = send_payload(&h.router, &body).await;
    assert_eq!(status, StatusCode::OK);

    h.chat.time_out_next_posts(1);
    let (status, response) = send_payload(&h.router, &body).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(response["thread_replies"], 1);

    assert_eq!(h.chat.attempts.load(Ordering::SeqCst), 3);
    let posts = h.chat.posts();
    assert_eq!(posts.len(), 2);
    assert_eq!(posts[1].message.thread_ts, posts[0].ts);
}
