//! Background sweep that evicts instances whose heartbeats stopped.

use crate::registry::ServiceRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Call [`ServiceRegistry::reap_stale`] every `interval` until `cancel` fires.
pub fn spawn_reaper(
    registry: Arc<ServiceRegistry>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        debug!("Registry reaper started (every {:?})", interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    for instance in registry.reap_stale() {
                        info!(
                            "Reaped stale instance {}/{} (last heartbeat {})",
                            instance.service_name, instance.instance_id, instance.last_heartbeat
                        );
                    }
                }
                _ = cancel.cancelled() => break,
            }
        }
        debug!("Registry reaper stopped");
    })
}
