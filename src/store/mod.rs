//! # External Store Binding
//!
//! When a distributed key-value store is configured it is the source of
//! truth for the routing table: the configuration manager writes through
//! to it before mutating in-memory state, and a periodic sync loop
//! (outside this crate) lists the store and calls
//! [`Context::reconcile`](crate::core::Context::reconcile).
//!
//! The key layout is shared between this crate and store
//! implementations: `<prefix>/services/<vsID>` and
//! `<prefix>/backends/<rsID>` hold JSON-serialized options, and an
//! advisory lock key guards every multi-key read or write.

use crate::core::{BackendOptions, ServiceOptions};
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Relative key prefix under which service documents are stored.
pub const SERVICE_PATH: &str = "services";

/// Relative key prefix under which backend documents are stored.
pub const BACKEND_PATH: &str = "backends";

/// Advisory lock key guarding multi-key store access.
pub const LOCK_KEY: &str = "gorblock";

/// TTL on the advisory lock.
pub const LOCK_TTL: Duration = Duration::from_secs(20);

/// Errors from store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store rejected the operation.
    #[error("store rejected the operation: {0}")]
    Rejected(String),

    /// The store could not be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A stored document could not be encoded or decoded.
    #[error("malformed store document: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Write-through interface driven by the configuration manager.
///
/// Creation calls happen before the corresponding in-memory mutation;
/// an error aborts the operation. Removal calls are best effort: a
/// failure is logged and removal proceeds, leaving reconciliation to
/// converge the difference.
#[async_trait]
pub trait StoreBinding: Send + Sync {
    /// Persists a virtual service document.
    async fn create_service(&self, vs_id: &str, opts: &ServiceOptions) -> StoreResult<()>;

    /// Persists a backend document, tagged with its parent service id.
    async fn create_backend(
        &self,
        vs_id: &str,
        rs_id: &str,
        opts: &BackendOptions,
    ) -> StoreResult<()>;

    /// Deletes a virtual service document.
    async fn remove_service(&self, vs_id: &str) -> StoreResult<()>;

    /// Deletes a backend document.
    async fn remove_backend(&self, rs_id: &str) -> StoreResult<()>;
}

/// Builds the store key for a virtual service document.
#[must_use]
pub fn service_key(prefix: &str, vs_id: &str) -> String {
    join_key(prefix, SERVICE_PATH, vs_id)
}

/// Builds the store key for a backend document.
#[must_use]
pub fn backend_key(prefix: &str, rs_id: &str) -> String {
    join_key(prefix, BACKEND_PATH, rs_id)
}

/// Builds the advisory lock key for a prefix.
#[must_use]
pub fn lock_key(prefix: &str) -> String {
    format!("{}/{LOCK_KEY}", prefix.trim_end_matches('/'))
}

fn join_key(prefix: &str, path: &str, id: &str) -> String {
    format!("{}/{path}/{id}", prefix.trim_end_matches('/'))
}

/// Extracts the logical object id from a store key.
///
/// The last path segment is the id; everything before it is prefix.
#[must_use]
pub fn logical_id(key: &str) -> &str {
    match key.rfind('/') {
        Some(index) if index > 0 => &key[index + 1..],
        _ => key,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        assert_eq!(service_key("/rudder", "web"), "/rudder/services/web");
        assert_eq!(backend_key("/rudder/", "web-1"), "/rudder/backends/web-1");
        assert_eq!(lock_key("/rudder"), "/rudder/gorblock");
    }

    #[test]
    fn test_logical_id_is_last_segment() {
        assert_eq!(logical_id("/rudder/services/web"), "web");
        assert_eq!(logical_id("backends/web-1"), "web-1");
    }

    #[test]
    fn test_logical_id_without_separator() {
        assert_eq!(logical_id("web"), "web");
        assert_eq!(logical_id("/web"), "/web");
    }
}
