//! Promalert service binary.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use promalert::chart::ChartRenderer;
use promalert::compose::MessageComposer;
use promalert::prometheus::{PrometheusClient, PrometheusConfig};
use promalert::retry::RetryPolicy;
use promalert::thread_store::InMemoryThreadStore;
use promalert::upload::{ObjectStoreUploader, S3Settings};
use promalert::{AlertProcessor, AppState, Collaborators, Config, ProcessorSettings};
use slack::SlackClient;

/// How often expired threads and idle identity locks are swept.
const SWEEP_INTERVAL: Duration = Duration::from_secs(300);

/// Alertmanager webhook that posts threaded Slack alerts with metric charts
#[derive(Parser)]
#[command(name = "promalert")]
#[command(version)]
struct Cli {
    /// Path to the YAML config file
    #[arg(short, long, env = "PROMALERT_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address, overrides the config file
    #[arg(long, env = "PROMALERT_LISTEN_ADDR")]
    listen: Option<String>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("promalert=debug,slack=debug,info")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("promalert=info,warn"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    let mut config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(listen) = cli.listen {
        config.listen_addr = listen;
    }
    config.validate().context("Invalid configuration")?;

    let timeout = config.call_timeout();

    let prometheus = PrometheusClient::new(PrometheusConfig {
        base_url: config.prometheus_url.clone(),
        timeout,
    })
    .context("Failed to create Prometheus client")?;
    if !prometheus.health_check().await {
        warn!(url = %config.prometheus_url, "Prometheus is not healthy yet");
    }

    let uploader = ObjectStoreUploader::s3(
        &S3Settings {
            bucket: config.s3_bucket.clone(),
            region: config.s3_region.clone(),
            endpoint: config.s3_endpoint.clone(),
        },
        &config.public_url_base(),
    )
    .context("Failed to create chart store")?;

    let chat = SlackClient::with_api_url(&config.slack_api_url, &config.slack_token, timeout)
        .context("Failed to create Slack client")?;

    let composer = MessageComposer::new(
        &config.header_template,
        &config.message_template,
        &config.footer_template,
    )
    .context("Failed to compile message templates")?;

    let threads = Arc::new(InMemoryThreadStore::new(config.thread_retention()));

    let processor = Arc::new(AlertProcessor::new(
        Collaborators {
            series: Arc::new(prometheus),
            charts: Arc::new(uploader),
            chat: Arc::new(chat),
            threads: threads.clone(),
        },
        composer,
        ChartRenderer::new(config.graph_scale, config.font_path.clone()),
        ProcessorSettings {
            default_channel: config.slack_channel.clone(),
            metric_resolution: config.metric_resolution,
            retry: RetryPolicy::new(&config.retry, timeout),
        },
    ));

    let sweeper = processor.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            interval.tick().await;
            let evicted = threads.evict_expired(Utc::now());
            let pruned = sweeper.locks().prune();
            debug!(evicted, pruned, "Swept thread state");
        }
    });

    info!(
        prometheus = %config.prometheus_url,
        channel = %config.slack_channel,
        bucket = %config.s3_bucket,
        "Starting promalert"
    );

    let state = Arc::new(AppState {
        processor,
        debug: config.debug,
    });
    promalert::run_server(state, &config.listen_addr)
        .await
        .context("Server error")?;

    Ok(())
}
