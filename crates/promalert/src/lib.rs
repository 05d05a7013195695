//! Alertmanager webhook receiver that posts threaded Slack alerts with charts.
//!
//! Each alert is keyed by an identity derived from its labels. The first firing
//! notification for an identity starts a thread; later notifications for the
//! same identity are broadcast replies in it, and resolution appends a footer to
//! the thread's top-level message.
//!
//! The alert rule's expression is split into its threshold comparisons. Every
//! comparison becomes one chart: the metric over a time window around the
//! alert, with the violating region shaded. Charts are uploaded to an object
//! store and linked as image blocks.
//!
//! - [`server`] receives webhooks and fans alerts out to the [`processor`]
//! - [`expr`] decomposes PromQL conditions into [`expr::PlotExpression`]s
//! - [`prometheus`] queries series; [`chart`] draws them; [`upload`] stores them
//! - [`compose`] renders message templates into Slack blocks
//! - [`thread_store`] remembers which thread each identity posts to

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod alert;
pub mod chart;
pub mod compose;
pub mod config;
pub mod error;
pub mod expr;
pub mod identity;
pub mod processor;
pub mod prometheus;
pub mod retry;
pub mod series;
pub mod server;
pub mod thread_store;
pub mod upload;
pub mod window;

pub use alert::{Alert, AlertStatus, AlertmanagerPayload, Severity};
pub use config::Config;
pub use error::AlertError;
pub use processor::{AlertProcessor, Collaborators, Outcome, ProcessorSettings};
pub use server::{build_router, run_server, AppState};
