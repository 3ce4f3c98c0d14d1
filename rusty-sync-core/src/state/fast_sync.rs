//! Fast sync: fetch the full state trie of a pivot block, then the blocks and
//! receipts just below it, and make the pivot the chain head.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rusty_sync_p2p::{PeerPool, SyncRole};
use rusty_sync_types::{hash_bytes, short_hex, Block, GetTrieNodes, Hash, PeerId, SealedHeader, TrieNodes, U256};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::node_request::NodeRequestQueue;
use super::pivot::{Pivot, PivotSelector};
use super::receipts::ReceiptsDownloader;
use super::trie_node::{NodeKind, TrieNodeDecoder};
use crate::chain::{ChainStore, StateStore};
use crate::config::{DownloaderConfig, FastSyncConfig};
use crate::downloader::BlockDownloader;
use crate::error::{SyncError, SyncResult, TransportError, ValidationError};
use crate::network::{with_read_timeout, SyncNetwork};
use crate::queue::{BlockWithPeer, ReverseSyncQueue};
use crate::validation::HeaderValidator;

/// Where a fast sync run currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FastSyncPhase {
    Idle,
    SelectingPivot,
    /// Crawling the state trie
    State,
    /// Fetching the blocks below the pivot
    Ancestors,
    Receipts,
    Complete,
    Failed,
}

impl FastSyncPhase {
    pub fn is_finished(&self) -> bool {
        matches!(self, FastSyncPhase::Complete | FastSyncPhase::Failed)
    }
}

/// Counters for status reporting
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FastSyncStats {
    pub nodes_inserted: u64,
    pub state_nodes: u64,
    pub storage_nodes: u64,
    pub code_nodes: u64,
    /// Nodes put back after a timeout or failed batch
    pub retries: u64,
    pub timeouts: u64,
    /// Hash mismatches plus nodes that matched their hash but did not decode
    pub invalid_nodes: u64,
    /// Nodes whose subtree could not be followed; any leaves the state partial
    pub undecodable_nodes: u64,
    pub queued: usize,
    pub pending: usize,
    pub known: usize,
}

#[derive(Debug, Default)]
struct Counters {
    nodes_inserted: AtomicU64,
    state_nodes: AtomicU64,
    storage_nodes: AtomicU64,
    code_nodes: AtomicU64,
    retries: AtomicU64,
    timeouts: AtomicU64,
    invalid_nodes: AtomicU64,
    undecodable_nodes: AtomicU64,
}

impl Counters {
    fn count_kind(&self, kind: NodeKind) {
        let counter = match kind {
            NodeKind::State => &self.state_nodes,
            NodeKind::Storage => &self.storage_nodes,
            NodeKind::Code => &self.code_nodes,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

struct NodesResponse {
    peer: PeerId,
    request_id: u64,
    hashes: Vec<Hash>,
    result: Result<TrieNodes, TransportError>,
    latency: Duration,
}

pub struct FastSyncManager {
    config: FastSyncConfig,
    downloader_config: DownloaderConfig,
    pool: Arc<PeerPool>,
    network: Arc<dyn SyncNetwork>,
    chain: Arc<dyn ChainStore>,
    state: Arc<dyn StateStore>,
    decoder: Arc<dyn TrieNodeDecoder>,
    validator: Arc<dyn HeaderValidator>,
    requests: Mutex<NodeRequestQueue>,
    /// Fetched nodes not yet handed to the state store
    writes: Mutex<Vec<(Hash, Vec<u8>)>>,
    counters: Counters,
    phase: watch::Sender<FastSyncPhase>,
    shutdown: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl FastSyncManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: FastSyncConfig,
        downloader_config: DownloaderConfig,
        pool: Arc<PeerPool>,
        network: Arc<dyn SyncNetwork>,
        chain: Arc<dyn ChainStore>,
        state: Arc<dyn StateStore>,
        decoder: Arc<dyn TrieNodeDecoder>,
        validator: Arc<dyn HeaderValidator>,
    ) -> Arc<Self> {
        let requests = NodeRequestQueue::new(config.queue_best_size);
        Arc::new(Self {
            config,
            downloader_config,
            pool,
            network,
            chain,
            state,
            decoder,
            validator,
            requests: Mutex::new(requests),
            writes: Mutex::new(Vec::new()),
            counters: Counters::default(),
            phase: watch::channel(FastSyncPhase::Idle).0,
            shutdown: watch::channel(false).0,
            worker: Mutex::new(None),
        })
    }

    pub fn phase(&self) -> FastSyncPhase {
        *self.phase.borrow()
    }

    fn set_phase(&self, phase: FastSyncPhase) {
        self.phase.send_replace(phase);
    }

    pub fn is_stopped(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub fn stats(&self) -> FastSyncStats {
        let (queued, pending, known) = {
            let requests = self.requests.lock();
            (requests.queued(), requests.pending(), requests.known())
        };
        FastSyncStats {
            nodes_inserted: self.counters.nodes_inserted.load(Ordering::Relaxed),
            state_nodes: self.counters.state_nodes.load(Ordering::Relaxed),
            storage_nodes: self.counters.storage_nodes.load(Ordering::Relaxed),
            code_nodes: self.counters.code_nodes.load(Ordering::Relaxed),
            retries: self.counters.retries.load(Ordering::Relaxed),
            timeouts: self.counters.timeouts.load(Ordering::Relaxed),
            invalid_nodes: self.counters.invalid_nodes.load(Ordering::Relaxed),
            undecodable_nodes: self.counters.undecodable_nodes.load(Ordering::Relaxed),
            queued,
            pending,
            known,
        }
    }

    /// Run fast sync on a background task. Without a pivot one is chosen from the peers.
    pub fn start_fast_sync(self: &Arc<Self>, pivot: Option<SealedHeader>) {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            warn!("Fast sync already running");
            return;
        }
        let manager = self.clone();
        *worker = Some(tokio::spawn(async move {
            if let Err(e) = manager.run(pivot).await {
                match e {
                    SyncError::Stopped => info!("Fast sync stopped"),
                    other => error!(error = %other, "Fast sync failed"),
                }
                manager.set_phase(FastSyncPhase::Failed);
            }
        }));
    }

    /// Resolve once the run completed or failed; true on success.
    pub async fn wait_finished(&self) -> bool {
        let mut phase = self.phase.subscribe();
        let complete = match phase.wait_for(FastSyncPhase::is_finished).await {
            Ok(phase) => *phase == FastSyncPhase::Complete,
            Err(_) => false,
        };
        complete
    }

    /// The whole pipeline; returns the header that became the chain head.
    pub async fn run(self: &Arc<Self>, pivot: Option<SealedHeader>) -> SyncResult<SealedHeader> {
        let started = Instant::now();
        let pivot = match pivot {
            Some(header) => {
                let total_difficulty = self.pool.get_best_peer().map_or_else(|| self.chain.total_difficulty(), |p| p.weight());
                Pivot { header, total_difficulty, votes: 0 }
            }
            None => {
                self.set_phase(FastSyncPhase::SelectingPivot);
                let selector = PivotSelector::new(
                    self.config.clone(),
                    self.downloader_config.read_timeout(),
                    self.pool.clone(),
                    self.network.clone(),
                    self.validator.clone(),
                );
                selector.select(self.shutdown.subscribe()).await?
            }
        };
        info!(number = pivot.header.number(), hash = %short_hex(&pivot.header.hash()), "Starting fast sync");

        self.sync_state(pivot.header.header().state_root).await?;

        self.set_phase(FastSyncPhase::Ancestors);
        let blocks = self.download_ancestors(&pivot).await?;
        let Some(pivot_block) = blocks.iter().find(|b| b.hash() == pivot.header.hash()).cloned() else {
            return Err(SyncError::Store(format!("pivot block {} was not fetched", pivot.header.number())));
        };

        self.set_phase(FastSyncPhase::Receipts);
        let receipts = ReceiptsDownloader::new(
            self.config.receipts_per_request,
            self.downloader_config.read_timeout(),
            self.config.loop_interval(),
            self.pool.clone(),
            self.network.clone(),
            self.chain.clone(),
        );
        let headers = blocks.iter().map(|b| b.header.clone().seal()).collect();
        receipts.download(headers, self.shutdown.subscribe()).await?;

        self.chain.set_best_block(&pivot_block, pivot.total_difficulty)?;
        self.set_phase(FastSyncPhase::Complete);
        info!(
            number = pivot.header.number(),
            elapsed_secs = started.elapsed().as_secs(),
            stats = ?self.stats(),
            "Fast sync complete"
        );
        Ok(pivot.header)
    }

    /// Fetch every trie node reachable from `root` that the state store lacks.
    pub async fn sync_state(self: &Arc<Self>, root: Hash) -> SyncResult<FastSyncStats> {
        self.set_phase(FastSyncPhase::State);
        if self.state.contains(&root) {
            info!(root = %short_hex(&root), "State root already present");
            return Ok(self.stats());
        }
        self.requests.lock().enqueue(NodeKind::State, root);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut shutdown = self.shutdown.subscribe();
        let mut ticker = interval(self.config.loop_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let started = Instant::now();
        let mut last_log = started;
        let mut last_inserted = self.counters.nodes_inserted.load(Ordering::Relaxed);

        loop {
            if *shutdown.borrow() {
                return Err(SyncError::Stopped);
            }
            self.process_timeouts(Instant::now());
            if self.requests.lock().is_done() {
                break;
            }
            self.request_next_nodes(&tx);

            if last_log.elapsed() >= self.config.progress_log_interval() {
                let inserted = self.counters.nodes_inserted.load(Ordering::Relaxed);
                let rate = (inserted - last_inserted) as f64 / last_log.elapsed().as_secs_f64();
                info!(nodes_per_sec = rate, stats = ?self.stats(), "Fast sync progress");
                last_log = Instant::now();
                last_inserted = inserted;
            }

            tokio::select! {
                Some(response) = rx.recv() => self.process_response(response),
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {}
            }
        }

        self.flush_writes()?;
        let undecodable = self.counters.undecodable_nodes.load(Ordering::Relaxed);
        if undecodable > 0 {
            error!(root = %short_hex(&root), undecodable, stats = ?self.stats(), "State download left subtrees unexplored");
            return Err(SyncError::Decode(format!("{undecodable} trie nodes under {} could not be decoded", short_hex(&root))));
        }
        info!(
            root = %short_hex(&root),
            elapsed_secs = started.elapsed().as_secs(),
            stats = ?self.stats(),
            "State download complete"
        );
        Ok(self.stats())
    }

    /// Send queued nodes to idle peers, one batch per peer.
    fn request_next_nodes(&self, tx: &mpsc::UnboundedSender<NodesResponse>) -> usize {
        let min_version = self.pool.config().preferred_protocol_version;
        let mut issued = 0;
        while self.requests.lock().queued() > 0 {
            let Some(peer) = self.pool.acquire_idle(SyncRole::NodeRetrieving, min_version) else { break };
            let batch = self.requests.lock().take_batch(self.config.nodes_per_request, peer.id(), Instant::now());
            let Some((request_id, hashes)) = batch else {
                self.pool.release(peer.id());
                break;
            };
            debug!(peer = %peer.id(), request_id, count = hashes.len(), "Requesting trie nodes");
            self.spawn_request(peer.id(), request_id, hashes, tx.clone());
            issued += 1;
        }
        issued
    }

    fn spawn_request(&self, peer: PeerId, request_id: u64, hashes: Vec<Hash>, tx: mpsc::UnboundedSender<NodesResponse>) {
        let network = self.network.clone();
        let timeout = self.downloader_config.read_timeout();
        self.pool.record_request(peer, hashes.len());
        tokio::spawn(async move {
            let started = Instant::now();
            let request = GetTrieNodes { hashes: hashes.clone() };
            let result = with_read_timeout(timeout, network.get_trie_nodes(peer, request)).await;
            let _ = tx.send(NodesResponse { peer, request_id, hashes, result, latency: started.elapsed() });
        });
    }

    fn process_response(&self, response: NodesResponse) {
        let NodesResponse { peer, request_id, hashes, result, latency } = response;
        let nodes = match result {
            Ok(TrieNodes { nodes }) => nodes,
            Err(e) => {
                let requeued = self.requests.lock().fail_batch(request_id, &hashes);
                self.counters.retries.fetch_add(requeued as u64, Ordering::Relaxed);
                match e {
                    TransportError::Timeout => {
                        warn!(peer = %peer, request_id, "Trie node request hit the read timeout, dropping peer");
                        self.pool.drop_peer(peer);
                    }
                    other => {
                        debug!(peer = %peer, request_id, error = %other, requeued, "Trie node request failed");
                        self.pool.release(peer);
                    }
                }
                return;
            }
        };

        let wanted: HashSet<Hash> = hashes.iter().copied().collect();
        let mut invalid = false;
        let mut stored = Vec::new();
        let mut unrequested = 0usize;
        {
            let mut requests = self.requests.lock();
            for (hash, bytes) in nodes {
                if !wanted.contains(&hash) {
                    unrequested += 1;
                    continue;
                }
                // late answers to an abandoned batch are dropped here
                let Some(mut request) = requests.accept(&hash, request_id) else { continue };
                if hash_bytes(&bytes) != hash {
                    debug!(peer = %peer, error = %ValidationError::NodeHashMismatch(hash), "Rejected trie node");
                    invalid = true;
                    self.counters.invalid_nodes.fetch_add(1, Ordering::Relaxed);
                    requests.requeue_front(request);
                    continue;
                }
                match self.decoder.children(request.kind, &bytes) {
                    Ok(children) => {
                        for (kind, child) in children {
                            if !self.state.contains(&child) {
                                requests.enqueue(kind, child);
                            }
                        }
                    }
                    Err(e) => {
                        // refetching cannot help, the bytes already match the hash
                        warn!(hash = %short_hex(&hash), kind = ?request.kind, error = %e, "Could not decode trie node");
                        self.counters.invalid_nodes.fetch_add(1, Ordering::Relaxed);
                        self.counters.undecodable_nodes.fetch_add(1, Ordering::Relaxed);
                    }
                }
                self.counters.count_kind(request.kind);
                request.response = Some(bytes);
                stored.push(request);
            }
            let requeued = requests.fail_batch(request_id, &hashes);
            self.counters.retries.fetch_add(requeued as u64, Ordering::Relaxed);
        }

        if unrequested > 0 {
            invalid = true;
            debug!(peer = %peer, unrequested, "Peer sent trie nodes that were not asked for");
        }
        let count = stored.len();
        self.counters.nodes_inserted.fetch_add(count as u64, Ordering::Relaxed);
        self.buffer_writes(stored.into_iter().filter_map(|r| r.response.map(|bytes| (r.hash, bytes))));

        if invalid {
            warn!(peer = %peer, "Invalid trie node response");
            if let Err(e) = self.pool.report_invalid(peer) {
                debug!(peer = %peer, error = %e, "Could not penalise peer");
            }
        } else {
            self.pool.record_response(peer, latency, count);
        }
    }

    /// Requeue requests that have been pending for longer than the trie request timeout.
    fn process_timeouts(&self, now: Instant) {
        let expired = self.requests.lock().expire(now, self.config.trie_request_timeout());
        if expired.is_empty() {
            return;
        }
        self.counters.timeouts.fetch_add(expired.len() as u64, Ordering::Relaxed);
        self.counters.retries.fetch_add(expired.len() as u64, Ordering::Relaxed);

        let peers: HashSet<PeerId> = expired.iter().filter_map(|e| e.peer).collect();
        for peer in peers {
            self.pool.record_timeout(peer);
        }
        for request in expired.iter().filter(|e| e.retries > self.config.retry_warn_threshold) {
            warn!(hash = %short_hex(&request.hash), retries = request.retries, "Trie node keeps timing out");
        }
        debug!(count = expired.len(), "Requeued timed out trie node requests");
    }

    fn buffer_writes(&self, nodes: impl Iterator<Item = (Hash, Vec<u8>)>) {
        let full = {
            let mut writes = self.writes.lock();
            writes.extend(nodes);
            writes.len() >= self.config.write_batch_size
        };
        if full {
            if let Err(e) = self.flush_writes() {
                error!(error = %e, "Could not write trie nodes");
            }
        }
    }

    /// Hand buffered nodes to the state store.
    pub fn flush_writes(&self) -> SyncResult<()> {
        let batch = std::mem::take(&mut *self.writes.lock());
        if batch.is_empty() {
            return Ok(());
        }
        let count = batch.len();
        if let Err(e) = self.state.put_batch(batch) {
            warn!(count, error = %e, "State write failed");
            return Err(e);
        }
        self.state.flush()?;
        debug!(count, "Flushed trie nodes");
        Ok(())
    }

    /// Fetch and persist the ancestor window below the pivot, highest first.
    async fn download_ancestors(&self, pivot: &Pivot) -> SyncResult<Vec<Block>> {
        let tip = pivot.header.number();
        let stop = tip.saturating_sub(self.config.ancestor_window).max(1).min(tip);
        let queue = ReverseSyncQueue::new(pivot.header.hash(), tip, stop);
        let (tx, mut rx) = mpsc::channel::<Vec<BlockWithPeer>>(self.downloader_config.export_channel_capacity);
        let downloader = BlockDownloader::new(
            "ancestors",
            self.downloader_config.clone(),
            queue,
            self.pool.clone(),
            self.network.clone(),
            self.validator.clone(),
            tx,
        );
        let handles = downloader.start();
        let mut shutdown = self.shutdown.subscribe();

        let mut total_difficulty = pivot.total_difficulty;
        let mut blocks = Vec::new();
        let mut outcome = Ok(());
        loop {
            tokio::select! {
                Some(batch) = rx.recv() => {
                    outcome = self.persist_ancestors(batch, &mut total_difficulty, &mut blocks);
                    if outcome.is_err() {
                        break;
                    }
                }
                _ = downloader.wait_complete() => break,
                _ = shutdown.changed() => {
                    outcome = Err(SyncError::Stopped);
                    break;
                }
            }
        }

        downloader.stop();
        for mut handle in handles {
            if tokio::time::timeout(self.config.close_timeout(), &mut handle).await.is_err() {
                handle.abort();
            }
        }
        if let Err(e) = outcome {
            warn!(error = %e, persisted = blocks.len(), "Ancestor download aborted");
            return Err(e);
        }
        while let Ok(batch) = rx.try_recv() {
            self.persist_ancestors(batch, &mut total_difficulty, &mut blocks)?;
        }
        info!(from = tip, to = stop, blocks = blocks.len(), "Ancestor window stored");
        Ok(blocks)
    }

    fn persist_ancestors(&self, batch: Vec<BlockWithPeer>, total_difficulty: &mut U256, blocks: &mut Vec<Block>) -> SyncResult<()> {
        for BlockWithPeer { block, .. } in batch {
            self.chain.persist_block(&block, *total_difficulty)?;
            *total_difficulty = total_difficulty.saturating_sub(block.header.difficulty);
            blocks.push(block);
        }
        Ok(())
    }

    /// Stop the run, flush buffered nodes and wait a bounded time for the worker.
    pub async fn close(&self) -> SyncResult<()> {
        self.shutdown.send_replace(true);
        let flushed = self.flush_writes();
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            match tokio::time::timeout(self.config.close_timeout(), handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "Fast sync worker ended abnormally"),
                Err(_) => warn!("Fast sync worker did not stop in time"),
            }
        }
        if !self.phase().is_finished() {
            self.set_phase(FastSyncPhase::Failed);
        }
        flushed?;
        self.flush_writes()
    }
}
