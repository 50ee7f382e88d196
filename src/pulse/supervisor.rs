//! Per-backend probe supervision.

use super::driver::Checker;
use super::error::PulseResult;
use super::metrics::Metrics;
use super::options::PulseOptions;
use rand::Rng;
use std::fmt;
use std::net::IpAddr;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Identity of a probe: the (service, backend) pair it reports for.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct PulseId {
    /// Parent virtual service id.
    pub vs_id: String,
    /// Backend id.
    pub rs_id: String,
}

impl PulseId {
    /// Creates a probe identity.
    #[must_use]
    pub fn new(vs_id: impl Into<String>, rs_id: impl Into<String>) -> Self {
        Self {
            vs_id: vs_id.into(),
            rs_id: rs_id.into(),
        }
    }
}

impl fmt::Display for PulseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.vs_id, self.rs_id)
    }
}

/// A pulse notification message.
#[derive(Debug, Clone)]
pub struct PulseUpdate {
    /// Probe that produced this update.
    pub source: PulseId,
    /// Metrics snapshot after folding in the latest outcome.
    pub metrics: Metrics,
}

/// A configured, not-yet-started probe for one backend.
#[derive(Debug)]
pub struct Pulse {
    checker: Checker,
    interval: Duration,
}

impl Pulse {
    /// Validates the options and prepares a probe for `ip:port`.
    pub fn new(ip: IpAddr, port: u16, opts: &PulseOptions) -> PulseResult<Self> {
        opts.validate()?;
        Ok(Self {
            checker: Checker::build(ip, port, opts),
            interval: opts.interval,
        })
    }

    /// Spawns the probe task and returns a handle to it.
    ///
    /// The first probe fires after a uniform-random delay in
    /// `[0, interval)` so a fleet of backends created together does not
    /// probe in lockstep. Publication on `updates` is abandoned when
    /// `stop` fires first, so a consumer that has already quit never
    /// wedges the probe task.
    pub fn start(
        self,
        id: PulseId,
        updates: mpsc::Sender<PulseUpdate>,
        mut stop: watch::Receiver<bool>,
    ) -> PulseHandle {
        let (stop_tx, mut stop_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            info!(pulse = %id, "starting pulse");

            if *stop.borrow() {
                return;
            }

            let mut metrics = Metrics::new();
            let mut delay = initial_delay(self.interval);

            loop {
                tokio::select! {
                    () = tokio::time::sleep(delay) => {
                        let status = self.checker.check().await;
                        let snapshot = metrics.update(status);
                        debug!(pulse = %id, status = %snapshot.status, health = snapshot.health, "pulse outcome");

                        let update = PulseUpdate {
                            source: id.clone(),
                            metrics: snapshot,
                        };
                        tokio::select! {
                            sent = updates.send(update) => {
                                if sent.is_err() {
                                    return;
                                }
                            }
                            _ = stop.changed() => return,
                        }
                    }
                    _ = stop_rx.changed() => {
                        info!(pulse = %id, "stopping pulse");
                        return;
                    }
                    _ = stop.changed() => return,
                }

                delay = self.interval;
            }
        });

        PulseHandle {
            stop: stop_tx,
            task,
        }
    }
}

/// First sleep before a probe runs, uniform in `[0, interval)`.
fn initial_delay(interval: Duration) -> Duration {
    let nanos = u64::try_from(interval.as_nanos()).unwrap_or(u64::MAX);
    if nanos == 0 {
        return Duration::ZERO;
    }
    Duration::from_nanos(rand::rng().random_range(0..nanos))
}

/// Handle to a running probe task.
#[derive(Debug)]
pub struct PulseHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl PulseHandle {
    /// Signals the probe to stop.
    ///
    /// The task terminates within one probe timeout; an in-flight
    /// publication may still be delivered and is dropped by the consumer
    /// once the backend is gone.
    pub fn stop(&self) {
        let _ = self.stop.send(true);
    }

    /// Whether the probe task has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
