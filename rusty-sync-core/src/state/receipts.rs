//! Receipts backfill for the blocks fetched below the pivot.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use rusty_sync_p2p::{PeerPool, SyncRole};
use rusty_sync_types::{receipts_root, short_hex, BlockReceipts, GetReceipts, PeerId, SealedHeader};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::chain::ChainStore;
use crate::error::{SyncError, SyncResult, TransportError, ValidationError};
use crate::network::{with_read_timeout, SyncNetwork};

pub struct ReceiptsDownloader {
    batch_size: usize,
    read_timeout: Duration,
    idle_wait: Duration,
    pool: Arc<PeerPool>,
    network: Arc<dyn SyncNetwork>,
    chain: Arc<dyn ChainStore>,
}

impl ReceiptsDownloader {
    pub fn new(
        batch_size: usize,
        read_timeout: Duration,
        idle_wait: Duration,
        pool: Arc<PeerPool>,
        network: Arc<dyn SyncNetwork>,
        chain: Arc<dyn ChainStore>,
    ) -> Self {
        Self { batch_size: batch_size.max(1), read_timeout, idle_wait, pool, network, chain }
    }

    /// Fetch and persist receipts for every header, retrying failed batches on other peers.
    pub async fn download(&self, headers: Vec<SealedHeader>, shutdown: watch::Receiver<bool>) -> SyncResult<usize> {
        let total = headers.len();
        let mut wanted: VecDeque<SealedHeader> = headers.into();
        let mut stored = 0usize;
        let started = Instant::now();

        while !wanted.is_empty() {
            if *shutdown.borrow() {
                return Err(SyncError::Stopped);
            }
            let min_version = self.pool.config().min_protocol_version;
            let mut batches = Vec::new();
            while !wanted.is_empty() {
                let Some(peer) = self.pool.acquire_idle(SyncRole::NodeRetrieving, min_version) else { break };
                let take = self.batch_size.min(wanted.len());
                batches.push((peer.id(), wanted.drain(..take).collect::<Vec<_>>()));
            }
            if batches.is_empty() {
                tokio::time::sleep(self.idle_wait).await;
                continue;
            }

            let results = join_all(batches.into_iter().map(|(peer, headers)| self.fetch(peer, headers))).await;
            let mut progressed = 0usize;
            for (count, leftover) in results {
                progressed += count;
                // missing or rejected entries go back to the front
                for header in leftover.into_iter().rev() {
                    wanted.push_front(header);
                }
            }
            stored += progressed;
            if progressed == 0 {
                tokio::time::sleep(self.idle_wait).await;
            }
        }

        info!(blocks = stored, requested = total, elapsed_ms = started.elapsed().as_millis() as u64, "Receipts backfill complete");
        Ok(stored)
    }

    /// Returns how many blocks got their receipts and the headers still wanting them.
    async fn fetch(&self, peer: PeerId, headers: Vec<SealedHeader>) -> (usize, Vec<SealedHeader>) {
        let request = GetReceipts { block_hashes: headers.iter().map(SealedHeader::hash).collect() };
        self.pool.record_request(peer, headers.len());
        let started = Instant::now();
        let result = with_read_timeout(self.read_timeout, self.network.get_receipts(peer, request)).await;

        let receipts = match result {
            Ok(BlockReceipts { receipts }) => receipts,
            Err(TransportError::Timeout) => {
                warn!(peer = %peer, "Receipts request timed out, dropping peer");
                self.pool.drop_peer(peer);
                return (0, headers);
            }
            Err(e) => {
                debug!(peer = %peer, error = %e, "Receipts request failed");
                self.pool.release(peer);
                return (0, headers);
            }
        };
        if receipts.len() > headers.len() {
            self.penalise(peer, "more receipt lists than requested");
            return (0, headers);
        }

        let answered = receipts.len();
        let mut headers = headers.into_iter();
        let mut stored = 0usize;
        for list in receipts {
            let Some(header) = headers.next() else { break };
            if receipts_root(&list) != header.header().receipts_root {
                let error = ValidationError::ReceiptsMismatch(header.hash());
                self.penalise(peer, &error.to_string());
                let mut leftover = vec![header];
                leftover.extend(headers);
                return (stored, leftover);
            }
            if let Err(e) = self.chain.persist_receipts(header.hash(), list) {
                warn!(hash = %short_hex(&header.hash()), error = %e, "Could not persist receipts");
                let mut leftover = vec![header];
                leftover.extend(headers);
                self.pool.release(peer);
                return (stored, leftover);
            }
            stored += 1;
        }
        self.pool.record_response(peer, started.elapsed(), answered);
        (stored, headers.collect())
    }

    fn penalise(&self, peer: PeerId, reason: &str) {
        warn!(peer = %peer, reason, "Invalid receipts from peer");
        if let Err(e) = self.pool.report_invalid(peer) {
            debug!(peer = %peer, error = %e, "Could not penalise peer");
        }
    }
}
