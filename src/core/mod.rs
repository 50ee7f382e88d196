//! # Configuration Manager
//!
//! The authoritative in-memory model of virtual services and their
//! backends. The [`Context`] validates inputs, serializes mutations,
//! drives the IPVS driver, spawns one probe per backend and feeds the
//! weight stasher, which keeps backend weights in sync with measured
//! health.

pub mod context;
pub mod error;
pub mod options;
mod stasher;

pub use context::{BackendInfo, Context, ContextBuilder, ServiceInfo};
pub use error::{CoreError, CoreResult};
pub use options::{BackendOptions, ServiceOptions};
