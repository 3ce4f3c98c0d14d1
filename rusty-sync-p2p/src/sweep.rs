use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

use crate::pool::PeerPool;

/// Run [`PeerPool::sweep`] on the configured interval until `shutdown` flips to true
/// or its sender is dropped.
pub fn spawn_sweep(pool: Arc<PeerPool>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    let period = pool.config().sweep_interval();
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = pool.sweep();
                    if !report.readmitted.is_empty() {
                        info!(count = report.readmitted.len(), "Re-admitted peers after ban expiry");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("Peer pool sweep stopped");
    })
}
