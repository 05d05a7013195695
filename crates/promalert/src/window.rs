//! Query time range for an alert's charts.

use chrono::{DateTime, TimeDelta, Timelike, Utc};
use tracing::debug;

/// Shortest lookback a chart covers.
pub const MIN_WINDOW: TimeDelta = TimeDelta::minutes(20);

/// Time range ending at `anchor` and reaching `duration` back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub anchor: DateTime<Utc>,
    pub duration: TimeDelta,
}

impl TimeWindow {
    /// Derive the window from an alert's start and end.
    ///
    /// When the start's second-of-minute is greater than the end's, the start is
    /// the anchor with a [`MIN_WINDOW`] lookback. Otherwise the window is
    /// anchored on the end and spans the whole alert, at least [`MIN_WINDOW`].
    /// An alert without an end is anchored on its start.
    #[must_use]
    pub fn select(starts_at: DateTime<Utc>, ends_at: Option<DateTime<Utc>>) -> Self {
        let window = match ends_at {
            Some(end) if starts_at.second() <= end.second() => Self {
                anchor: end,
                duration: (end - starts_at).max(MIN_WINDOW),
            },
            _ => Self {
                anchor: starts_at,
                duration: MIN_WINDOW,
            },
        };

        debug!(
            anchor = %window.anchor,
            duration_secs = window.duration.num_seconds(),
            "Selected chart window"
        );
        window
    }

    #[must_use]
    pub fn start(&self) -> DateTime<Utc> {
        self.anchor - self.duration
    }

    /// Query step giving roughly `resolution` points, never below one second.
    #[must_use]
    pub fn step(&self, resolution: u32) -> TimeDelta {
        let points = i32::try_from(resolution.max(1)).unwrap_or(i32::MAX);
        (self.duration / points).max(TimeDelta::seconds(1))
    }
}
