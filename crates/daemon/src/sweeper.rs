//! Background reclamation loop.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::engine::LeaseEngine;

/// Run [`LeaseEngine::sweep`] every `period`, starting immediately.
///
/// Ticks run one after another on a blocking thread; a tick that overruns the
/// period causes the missed ticks to be skipped rather than bunched up.
pub fn spawn(engine: Arc<LeaseEngine>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            interval.tick().await;

            let engine = engine.clone();
            match tokio::task::spawn_blocking(move || engine.sweep()).await {
                Ok(report) if report.is_empty() => debug!("Sweep found nothing to reclaim"),
                Ok(report) => info!(
                    expired = report.expired.len(),
                    abandoned = report.abandoned.len(),
                    shrunk = report.shrunk,
                    "Sweep reclaimed leases"
                ),
                Err(e) => error!(error = %e, "Sweep task failed"),
            }
        }
    })
}
