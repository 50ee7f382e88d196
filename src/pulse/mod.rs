//! # Pulse
//!
//! Periodic health probes ("pulses") for backends.
//!
//! Every registered backend owns one long-lived probe task composed from
//! a driver (TCP connect, HTTP request, or none) and an interval. Each
//! outcome is folded into a rolling [`Metrics`] window and published as a
//! [`PulseUpdate`] on a shared channel, where the weight stasher consumes
//! it. Initial probes are jittered across the fleet to avoid a
//! thundering herd.

pub mod driver;
pub mod error;
pub mod metrics;
pub mod options;
pub mod supervisor;

pub use driver::{Checker, CHECK_TIMEOUT};
pub use error::{PulseError, PulseResult};
pub use metrics::{Metrics, Status};
pub use options::{DriverArgs, PulseKind, PulseOptions};
pub use supervisor::{Pulse, PulseHandle, PulseId, PulseUpdate};
