//! Per-alert processing: charts, composition and the thread state machine.
//!
//! For an alert with identity `I`:
//!
//! | thread for `I` | status   | action                                              |
//! |----------------|----------|-----------------------------------------------------|
//! | none           | firing   | full message, new top-level post, store the thread  |
//! | none           | resolved | short message, new top-level post, nothing stored   |
//! | exists         | firing   | full message, broadcast reply, refresh stored body  |
//! | exists         | resolved | short message, broadcast reply, footer on the root  |
//!
//! Lookup, post and upsert for one identity run under that identity's lock, so
//! two concurrent firings cannot both start a thread.

use chrono::Utc;
use futures::future::try_join_all;
use slack::{ChatClient, OutgoingMessage, PostedMessage};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::alert::{Alert, RESOLVED_COLOR};
use crate::chart::ChartRenderer;
use crate::compose::{ChartImage, MessageComposer};
use crate::error::{AlertError, DeliveryError, RenderError};
use crate::expr::{decompose, PlotExpression};
use crate::retry::RetryPolicy;
use crate::series::{select_series, RangeQuery, SeriesSource};
use crate::thread_store::{IdentityLocks, ThreadState, ThreadStateStore};
use crate::upload::ChartStore;
use crate::window::TimeWindow;

/// What processing an alert did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// A firing alert started a new thread
    ThreadCreated { channel: String, ts: String },
    /// The alert was posted into its existing thread
    ThreadReplied {
        channel: String,
        ts: String,
        thread_ts: String,
    },
    /// A resolved alert without a thread was posted on its own
    ResolvedUnthreaded { channel: String, ts: String },
}

/// Tunables of the processor.
#[derive(Debug, Clone)]
pub struct ProcessorSettings {
    /// Channel for new threads when the rule names none
    pub default_channel: String,
    /// Points per chart
    pub metric_resolution: u32,
    pub retry: RetryPolicy,
}

/// External collaborators of the processor.
#[derive(Clone)]
pub struct Collaborators {
    pub series: Arc<dyn SeriesSource>,
    pub charts: Arc<dyn ChartStore>,
    pub chat: Arc<dyn ChatClient>,
    pub threads: Arc<dyn ThreadStateStore>,
}

/// Turns alerts into threaded chat messages.
pub struct AlertProcessor {
    series: Arc<dyn SeriesSource>,
    charts: Arc<dyn ChartStore>,
    chat: Arc<dyn ChatClient>,
    threads: Arc<dyn ThreadStateStore>,
    locks: IdentityLocks,
    composer: MessageComposer,
    renderer: ChartRenderer,
    settings: ProcessorSettings,
}

impl AlertProcessor {
    #[must_use]
    pub fn new(
        collaborators: Collaborators,
        composer: MessageComposer,
        renderer: ChartRenderer,
        settings: ProcessorSettings,
    ) -> Self {
        Self {
            series: collaborators.series,
            charts: collaborators.charts,
            chat: collaborators.chat,
            threads: collaborators.threads,
            locks: IdentityLocks::new(),
            composer,
            renderer,
            settings,
        }
    }

    #[must_use]
    pub fn threads(&self) -> &Arc<dyn ThreadStateStore> {
        &self.threads
    }

    #[must_use]
    pub fn locks(&self) -> &IdentityLocks {
        &self.locks
    }

    /// Process one alert.
    pub async fn process(&self, alert: &Alert) -> Result<Outcome, AlertError> {
        let identity = alert.identity();
        let _guard = self.locks.lock(&identity).await;

        let existing = self.threads.lookup(&identity).await?;
        info!(
            identity = %identity,
            alert = alert.name(),
            status = %alert.status,
            threaded = existing.is_some(),
            "Processing alert"
        );

        let images = self.render_charts(alert).await?;

        match existing {
            None => self.post_new(alert, &identity, &images).await,
            Some(thread) => self.post_reply(alert, &identity, thread, &images).await,
        }
    }

    fn color(alert: &Alert) -> Option<String> {
        if alert.is_firing() {
            alert.severity().color().map(ToString::to_string)
        } else {
            Some(RESOLVED_COLOR.to_string())
        }
    }

    async fn post_new(
        &self,
        alert: &Alert,
        identity: &str,
        images: &[ChartImage],
    ) -> Result<Outcome, AlertError> {
        let channel = alert
            .channel_override
            .clone()
            .unwrap_or_else(|| self.settings.default_channel.clone());

        if !alert.is_firing() {
            debug!("Composing short message");
            let blocks = self.composer.short_message(alert, &channel, images)?;
            let posted = self
                .post(OutgoingMessage {
                    channel,
                    color: Self::color(alert),
                    blocks,
                    ..Default::default()
                })
                .await?;
            info!(channel = %posted.channel, ts = %posted.ts, "Resolved alert posted without thread");
            return Ok(Outcome::ResolvedUnthreaded {
                channel: posted.channel,
                ts: posted.ts,
            });
        }

        debug!("Composing full message");
        let blocks = self.composer.full_message(alert, &channel, images)?;
        let posted = self
            .post(OutgoingMessage {
                channel,
                color: Self::color(alert),
                blocks: blocks.clone(),
                ..Default::default()
            })
            .await?;

        self.threads
            .upsert(
                identity,
                ThreadState {
                    channel: posted.channel.clone(),
                    ts: posted.ts.clone(),
                    body: blocks,
                    updated_at: Utc::now(),
                },
            )
            .await?;

        info!(channel = %posted.channel, ts = %posted.ts, "Thread created");
        Ok(Outcome::ThreadCreated {
            channel: posted.channel,
            ts: posted.ts,
        })
    }

    async fn post_reply(
        &self,
        alert: &Alert,
        identity: &str,
        thread: ThreadState,
        images: &[ChartImage],
    ) -> Result<Outcome, AlertError> {
        let blocks = if alert.is_firing() {
            self.composer.full_message(alert, &thread.channel, images)?
        } else {
            self.composer.short_message(alert, &thread.channel, images)?
        };

        let posted = self
            .post(OutgoingMessage {
                channel: thread.channel.clone(),
                color: Self::color(alert),
                blocks: blocks.clone(),
                thread_ts: Some(thread.ts.clone()),
                broadcast: true,
            })
            .await?;
        info!(
            channel = %posted.channel,
            thread_ts = %thread.ts,
            "Reply posted to thread"
        );

        if alert.is_firing() {
            self.threads
                .upsert(
                    identity,
                    ThreadState {
                        body: blocks,
                        updated_at: Utc::now(),
                        ..thread.clone()
                    },
                )
                .await?;
        } else {
            self.close_thread(alert, &thread).await;
        }

        Ok(Outcome::ThreadReplied {
            channel: posted.channel,
            ts: posted.ts,
            thread_ts: thread.ts,
        })
    }

    /// Append the footer to the thread's top-level message. The reply is
    /// already delivered, so failures are only logged.
    async fn close_thread(&self, alert: &Alert, thread: &ThreadState) {
        let footer = match self.composer.footer(alert, &thread.channel) {
            Ok(Some(footer)) => footer,
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "Failed to render footer");
                return;
            }
        };

        let mut blocks = thread.body.clone();
        blocks.push(footer);
        let message = OutgoingMessage {
            channel: thread.channel.clone(),
            color: Some(RESOLVED_COLOR.to_string()),
            blocks,
            ..Default::default()
        };

        let result = self
            .settings
            .retry
            .run("chat.update", || self.chat.update_message(&thread.ts, &message))
            .await;
        match result {
            Ok(_) => debug!(ts = %thread.ts, "Footer added to thread"),
            Err(e) => warn!(ts = %thread.ts, error = %e, "Failed to add footer to thread"),
        }
    }

    /// Post with retries. A top-level post that may already have been delivered
    /// is not repeated, since a second copy would start a second thread.
    async fn post(&self, message: OutgoingMessage) -> Result<PostedMessage, DeliveryError> {
        let top_level = message.thread_ts.is_none();
        self.settings
            .retry
            .run_if(
                "chat.postMessage",
                |e: &DeliveryError| {
                    e.is_transient() && !(top_level && e.may_have_been_delivered())
                },
                || self.chat.post_message(&message),
            )
            .await
    }

    /// Render and upload one chart per decomposed condition, in decomposition
    /// order. The first failure aborts the whole set.
    async fn render_charts(&self, alert: &Alert) -> Result<Vec<ChartImage>, AlertError> {
        let query = alert.generator_query();
        let expressions = decompose(&query);
        if expressions.is_empty() {
            return Ok(Vec::new());
        }

        let window = TimeWindow::select(alert.starts_at, alert.ends_at);
        try_join_all(
            expressions
                .iter()
                .map(|expr| self.render_chart(alert, expr, window)),
        )
        .await
    }

    async fn render_chart(
        &self,
        alert: &Alert,
        expr: &PlotExpression,
        window: TimeWindow,
    ) -> Result<ChartImage, AlertError> {
        let query = RangeQuery {
            formula: expr.formula.clone(),
            start: window.start(),
            end: window.anchor,
            step: window.step(self.settings.metric_resolution),
        };
        debug!(
            formula = %expr.formula,
            anchor = %window.anchor,
            duration_secs = window.duration.num_seconds(),
            "Querying series"
        );

        let series = self
            .settings
            .retry
            .run("query_range", || self.series.query_range(&query))
            .await?;
        let selected = select_series(series, &alert.labels);

        let renderer = self.renderer.clone();
        let expr = expr.clone();
        let range = (query.start, query.end);
        let chart = tokio::task::spawn_blocking(move || renderer.render(&selected, &expr, range))
            .await
            .map_err(|e| RenderError::Join(e.to_string()))??;

        let png = chart.png;
        let url = self
            .settings
            .retry
            .run("upload", || self.charts.upload(png.clone()))
            .await?;
        info!(url = %url, title = %chart.title, "Chart uploaded");

        Ok(ChartImage {
            url,
            title: chart.title,
        })
    }
}
