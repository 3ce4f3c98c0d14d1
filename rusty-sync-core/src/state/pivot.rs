//! Pivot block selection for fast sync.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use rusty_sync_p2p::{Peer, PeerPool};
use rusty_sync_types::{short_hex, BlockHeaders, GetHeaders, Hash, PeerId, SealedHeader, U256};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::FastSyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::network::{with_read_timeout, SyncNetwork};
use crate::validation::HeaderValidator;

const PIVOT_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// A pivot header agreed on by a majority of the asked peers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pivot {
    pub header: SealedHeader,
    /// Weight advertised by the best peer when the pivot was chosen
    pub total_difficulty: U256,
    /// Peers that returned this header
    pub votes: usize,
}

pub struct PivotSelector {
    config: FastSyncConfig,
    read_timeout: Duration,
    pool: Arc<PeerPool>,
    network: Arc<dyn SyncNetwork>,
    validator: Arc<dyn HeaderValidator>,
}

impl PivotSelector {
    pub fn new(
        config: FastSyncConfig,
        read_timeout: Duration,
        pool: Arc<PeerPool>,
        network: Arc<dyn SyncNetwork>,
        validator: Arc<dyn HeaderValidator>,
    ) -> Self {
        Self { config, read_timeout, pool, network, validator }
    }

    /// Wait until enough peers are connected (or the force timeout passed) and
    /// retry until a pivot is agreed on or `shutdown` fires.
    pub async fn select(&self, mut shutdown: watch::Receiver<bool>) -> SyncResult<Pivot> {
        let started = Instant::now();
        loop {
            if *shutdown.borrow() {
                return Err(SyncError::Stopped);
            }
            let forced = started.elapsed() >= self.config.pivot_force();
            if self.pool.active_count() >= self.config.min_peers_for_pivot || forced {
                match self.try_select().await {
                    Ok(pivot) => return Ok(pivot),
                    Err(e) => debug!(error = %e, forced, "Pivot not settled yet"),
                }
            } else {
                debug!(
                    peers = self.pool.active_count(),
                    needed = self.config.min_peers_for_pivot,
                    "Waiting for peers before choosing a pivot"
                );
            }
            tokio::select! {
                _ = tokio::time::sleep(PIVOT_RETRY_INTERVAL) => {}
                _ = shutdown.changed() => {}
            }
        }
    }

    /// One round: find the pivot number from the best peer and poll idle peers for it.
    pub async fn try_select(&self) -> SyncResult<Pivot> {
        let best = self.pool.get_best_peer().ok_or_else(|| SyncError::NoPivot("no peers".into()))?;
        let best_number = self.best_number(&best).await?;
        let pivot_number = best_number
            .checked_sub(self.config.pivot_distance)
            .filter(|n| *n > 0)
            .ok_or_else(|| SyncError::NoPivot(format!("best peer only at block {best_number}")))?;

        let mut peers: Vec<PeerId> = vec![best.id()];
        peers.extend(self.pool.get_all_idle().iter().map(Peer::id).filter(|id| *id != best.id()));
        peers.truncate(self.config.pivot_peers.max(1));

        let request = GetHeaders::by_number(pivot_number, 1, false);
        let responses = join_all(peers.iter().map(|peer| {
            let network = self.network.clone();
            let request = request.clone();
            let peer = *peer;
            async move { (peer, with_read_timeout(self.read_timeout, network.get_headers(peer, request)).await) }
        }))
        .await;

        let mut votes: HashMap<Hash, (usize, SealedHeader)> = HashMap::new();
        let mut answered = 0usize;
        for (peer, response) in responses {
            let header = match response {
                Ok(BlockHeaders { mut headers }) if !headers.is_empty() => headers.swap_remove(0),
                Ok(_) => continue,
                Err(e) => {
                    debug!(peer = %peer, error = %e, "Pivot request failed");
                    continue;
                }
            };
            if header.number != pivot_number {
                warn!(peer = %peer, got = header.number, wanted = pivot_number, "Peer answered with the wrong pivot height");
                continue;
            }
            if let Err(e) = self.validator.validate(&header) {
                warn!(peer = %peer, error = %e, "Invalid pivot header");
                continue;
            }
            answered += 1;
            let sealed = header.seal();
            votes.entry(sealed.hash()).or_insert_with(|| (0, sealed)).0 += 1;
        }

        let (count, header) = votes
            .into_values()
            .max_by_key(|(count, _)| *count)
            .ok_or_else(|| SyncError::NoPivot(format!("no answers for block {pivot_number}")))?;
        if count * 2 <= answered {
            return Err(SyncError::NoPivot(format!("no majority for block {pivot_number}: {count} of {answered}")));
        }

        info!(number = pivot_number, hash = %short_hex(&header.hash()), votes = count, asked = peers.len(), "Selected fast sync pivot");
        Ok(Pivot { header, total_difficulty: best.weight(), votes: count })
    }

    async fn best_number(&self, best: &Peer) -> SyncResult<u64> {
        if let Some(number) = best.info.best_number {
            return Ok(number);
        }
        let request = GetHeaders::by_hash(best.info.best_hash, 1, false);
        let response = with_read_timeout(self.read_timeout, self.network.get_headers(best.id(), request)).await?;
        response
            .headers
            .first()
            .map(|h| h.number)
            .ok_or_else(|| SyncError::NoPivot(format!("peer {} did not return its head", best.id())))
    }
}
