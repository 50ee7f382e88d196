//! Rolling health metrics for a probed backend.

use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

/// Number of probe outcomes kept in the rolling health window.
const WINDOW: usize = 100;

/// Result of a single probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// The backend responded to the probe.
    Up,
    /// The backend did not respond to the probe.
    Down,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Up => write!(f, "up"),
            Self::Down => write!(f, "down"),
        }
    }
}

/// Statistical information about a backend's pulse.
///
/// A fresh backend starts optimistic: up, fully healthy, zero uptime.
/// Readers always receive a snapshot; the probe task owns the live value.
#[derive(Debug, Clone, Serialize)]
pub struct Metrics {
    /// Result of the most recent probe.
    pub status: Status,

    /// Share of successful probes over the last [`WINDOW`] samples,
    /// in `[0, 1]`.
    pub health: f64,

    /// Time accumulated since the backend last came up.
    #[serde(with = "humantime_serde")]
    pub uptime: Duration,

    #[serde(skip)]
    last_ts: Instant,

    #[serde(skip)]
    record: VecDeque<Status>,
}

impl Metrics {
    /// Creates fresh metrics for a newly registered backend.
    #[must_use]
    pub fn new() -> Self {
        Self {
            status: Status::Up,
            health: 1.0,
            uptime: Duration::ZERO,
            last_ts: Instant::now(),
            record: VecDeque::with_capacity(WINDOW),
        }
    }

    /// Folds a probe outcome into the rolling window and returns a
    /// snapshot of the updated metrics.
    ///
    /// Any non-up outcome resets the uptime counter.
    pub fn update(&mut self, status: Status) -> Metrics {
        self.status = status;

        self.record.push_back(status);
        if self.record.len() > WINDOW {
            self.record.pop_front();
        }

        let downs = self.record.iter().filter(|s| **s == Status::Down).count();
        self.health = 1.0 - downs as f64 / self.record.len() as f64;

        let now = Instant::now();
        if self.status == Status::Up {
            self.uptime += now.saturating_duration_since(self.last_ts);
        } else {
            self.uptime = Duration::ZERO;
        }
        self.last_ts = now;

        self.clone()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
