//! Periodic eviction of idle and dead apps

use crate::registry::Registry;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

/// Sweep `registry` every `interval` until `shutdown_rx` flips to true.
///
/// Each sweep runs on its own task so a panic while stopping one app is
/// logged and the next tick still fires.
pub async fn run_reaper(
    registry: Arc<Registry>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately
    ticker.tick().await;

    debug!(interval_ms = interval.as_millis() as u64, "Reaper started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let sweep_registry = Arc::clone(&registry);
                match tokio::spawn(async move { sweep_registry.sweep().await }).await {
                    Ok(evicted) if !evicted.is_empty() => {
                        info!(apps = ?evicted, remaining = registry.len(), "Reaped apps");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!(error = %e, "Sweep failed");
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }

    debug!("Reaper stopped");
}
