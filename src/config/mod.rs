//! # Daemon Configuration
//!
//! TOML-based configuration for the rudder daemon. Flag parsing and the
//! HTTP admin surface live outside this crate; this module only carries
//! the settings the core consumes.
//!
//! ## Example
//!
//! ```toml
//! device = "eth0"
//! flush = false
//! listen = ":4672"
//!
//! [store]
//! url = "consul://127.0.0.1:8500/rudder"
//! sync_interval = 60
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration file could not be parsed.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// The configuration is semantically invalid.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Top-level daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Interface whose primary address becomes the default endpoint for
    /// services declared without a host.
    pub device: String,

    /// Flush existing IPVS pools on start.
    pub flush: bool,

    /// Interface VIPs are attached to; absent disables attachment.
    pub vip_interface: Option<String>,

    /// Endpoint the admin surface listens on.
    pub listen: String,

    /// External store synchronization; absent disables it.
    pub store: Option<StoreConfig>,

    /// Discovery registration; absent disables it.
    pub disco: Option<DiscoConfig>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            device: default_device(),
            flush: false,
            vip_interface: None,
            listen: default_listen(),
            store: None,
            disco: None,
        }
    }
}

/// External store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Store URL; the scheme selects the backend and the path is the
    /// key prefix.
    pub url: String,

    /// Relative path under the prefix for service documents.
    pub service_path: String,

    /// Relative path under the prefix for backend documents.
    pub backend_path: String,

    /// Seconds between synchronization passes.
    pub sync_interval: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            service_path: crate::store::SERVICE_PATH.to_string(),
            backend_path: crate::store::BACKEND_PATH.to_string(),
            sync_interval: 60,
        }
    }
}

/// Discovery registration settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoConfig {
    /// Discovery agent URL; empty disables registration.
    pub url: String,
}

impl DaemonConfig {
    /// Loads and validates configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> ConfigResult<()> {
        if let Some(store) = &self.store {
            if store.url.is_empty() {
                return Err(ConfigError::Invalid(
                    "store section requires a url".to_string(),
                ));
            }
            if store.sync_interval == 0 {
                return Err(ConfigError::Invalid(
                    "store sync_interval must be positive".to_string(),
                ));
            }
        }
        Ok(())
    }
}

fn default_device() -> String {
    "eth0".to_string()
}

fn default_listen() -> String {
    ":4672".to_string()
}
