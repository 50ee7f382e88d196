//! Pulse configuration options.

use super::error::{PulseError, PulseResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// Kind of health probe to run against a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PulseKind {
    /// TCP connect probe. The safe guess: most services are TCP-based.
    #[default]
    Tcp,
    /// HTTP request probe.
    Http,
    /// No probing; the backend always reports up.
    None,
}

impl FromStr for PulseKind {
    type Err = PulseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "tcp" => Ok(Self::Tcp),
            "http" => Ok(Self::Http),
            "none" => Ok(Self::None),
            other => Err(PulseError::UnknownType(other.to_string())),
        }
    }
}

/// Loose argument bag passed through to the probe driver.
///
/// Recognized keys depend on the pulse kind; for `http` these are `path`
/// (default `/`), `method` (default `GET`) and `expect` (default `200`).
/// Unknown keys are ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DriverArgs(HashMap<String, Value>);

impl DriverArgs {
    /// Creates an empty argument bag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts an argument value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    /// Returns a string argument, or `default` if absent or mistyped.
    #[must_use]
    pub fn get_str(&self, key: &str, default: &str) -> String {
        match self.0.get(key) {
            None => default.to_string(),
            Some(Value::String(s)) => s.clone(),
            Some(other) => {
                warn!(key, value = %other, "expected a string for pulse option");
                default.to_string()
            }
        }
    }

    /// Returns a numeric argument as `u16`, or `default` if absent,
    /// mistyped or out of range.
    #[must_use]
    pub fn get_u16(&self, key: &str, default: u16) -> u16 {
        match self.0.get(key) {
            None => default,
            Some(Value::Number(n)) => n
                .as_u64()
                .and_then(|v| u16::try_from(v).ok())
                .unwrap_or_else(|| {
                    warn!(key, value = %n, "pulse option out of range");
                    default
                }),
            Some(other) => {
                warn!(key, value = %other, "expected a number for pulse option");
                default
            }
        }
    }
}

/// Health probe configuration for a single backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PulseOptions {
    /// Probe kind.
    #[serde(rename = "type")]
    pub kind: PulseKind,

    /// Interval between probes.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,

    /// Driver-specific arguments.
    pub args: DriverArgs,
}

impl Default for PulseOptions {
    fn default() -> Self {
        Self {
            kind: PulseKind::default(),
            interval: Duration::from_secs(60),
            args: DriverArgs::default(),
        }
    }
}

impl PulseOptions {
    /// Validates the probe configuration.
    pub fn validate(&self) -> PulseResult<()> {
        if self.interval.is_zero() {
            return Err(PulseError::InvalidInterval);
        }
        Ok(())
    }

    /// Convenience constructor for a disabled probe.
    #[must_use]
    pub fn none(interval: Duration) -> Self {
        Self {
            kind: PulseKind::None,
            interval,
            ..Self::default()
        }
    }
}
