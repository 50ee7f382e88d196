//! The weight stasher: pulse update consumption.
//!
//! A single task drains the shared pulse update channel and translates
//! health transitions into weight mutations. When a backend goes down
//! its operator-configured weight is stashed and the live weight drops
//! to zero; as it recovers, the weight is restored in proportion to
//! measured health and the stash entry is erased once the backend is
//! fully healthy again.

use super::context::ContextInner;
use crate::pulse::{PulseId, PulseUpdate, Status};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, warn};

/// Runs the stasher until the global stop signal fires or the update
/// channel closes. Remaining updates are not drained on stop.
pub(crate) async fn run(
    inner: Arc<ContextInner>,
    mut updates: mpsc::Receiver<PulseUpdate>,
    mut stop: watch::Receiver<bool>,
) {
    let mut stash: HashMap<PulseId, i32> = HashMap::new();

    loop {
        tokio::select! {
            _ = stop.changed() => {
                debug!("weight stasher stopped");
                return;
            }
            update = updates.recv() => match update {
                Some(update) => process_update(&inner, &mut stash, update).await,
                None => return,
            },
        }
    }
}

/// Applies one pulse update to the registry and the stash.
pub(crate) async fn process_update(
    inner: &ContextInner,
    stash: &mut HashMap<PulseId, i32>,
    update: PulseUpdate,
) {
    let PulseUpdate { source, metrics } = update;

    {
        let mut reg = inner.registry.write().await;
        // A probe may still deliver after its backend was removed;
        // membership is checked under the lock and stale updates drop.
        let Some(rs) = reg.backends.get_mut(&source.rs_id) else {
            return;
        };

        if rs.metrics.status != metrics.status {
            warn!(backend = %source, status = %metrics.status, "backend status changed");
        }
        rs.metrics = metrics.clone();
    }

    match metrics.status {
        Status::Up => {
            // The weight stays stashed until the backend recovers.
            let Some(&stashed) = stash.get(&source) else {
                return;
            };

            // Restore a relative weight considering the backend's health.
            #[allow(clippy::cast_possible_truncation)]
            let target = (f64::from(stashed) * metrics.health).floor() as i32;

            match inner
                .update_backend(&source.vs_id, &source.rs_id, target)
                .await
            {
                Ok(_) if target == stashed => {
                    // The backend has completely recovered.
                    stash.remove(&source);
                }
                Ok(_) => {}
                Err(e) => error!(backend = %source, error = %e, "error while unstashing backend"),
            }
        }
        Status::Down => {
            if stash.contains_key(&source) {
                return;
            }

            match inner.update_backend(&source.vs_id, &source.rs_id, 0).await {
                Ok(previous) => {
                    stash.insert(source, previous);
                }
                Err(e) => error!(backend = %source, error = %e, "error while stashing backend"),
            }
        }
    }
}
