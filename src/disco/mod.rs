//! # Service Discovery Binding
//!
//! Virtual services are announced to an external discovery system when
//! they are created and withdrawn when they are removed. The concrete
//! registrar (e.g. a Consul client) lives outside this crate; the
//! configuration manager only drives this trait and logs failures
//! without failing the originating operation.

use async_trait::async_trait;
use std::fmt;
use tracing::debug;

/// An error reported by a discovery driver.
#[derive(Debug)]
pub struct DiscoError(String);

impl DiscoError {
    /// Creates a discovery error with the given message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl fmt::Display for DiscoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for DiscoError {}

/// Result type for discovery operations.
pub type DiscoResult = Result<(), DiscoError>;

/// Registers virtual services with an external discovery system.
#[async_trait]
pub trait DiscoveryDriver: Send + Sync {
    /// Announces `name` as reachable at `host:port`.
    async fn expose(&self, name: &str, host: &str, port: u16) -> DiscoResult;

    /// Withdraws a previous announcement.
    async fn remove(&self, name: &str) -> DiscoResult;
}

/// Discovery driver that announces nothing.
///
/// Used when no discovery system is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopDiscovery;

#[async_trait]
impl DiscoveryDriver for NoopDiscovery {
    async fn expose(&self, name: &str, host: &str, port: u16) -> DiscoResult {
        debug!(name, host, port, "discovery disabled, skipping expose");
        Ok(())
    }

    async fn remove(&self, name: &str) -> DiscoResult {
        debug!(name, "discovery disabled, skipping remove");
        Ok(())
    }
}
