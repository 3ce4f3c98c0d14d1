//! Block downloader: a header loop and a body loop around a [`SyncQueue`].
//!
//! Each loop asks the queue what is still missing, hands the work to idle
//! peers and then waits on its latch. Responses come back over a per-loop
//! channel and are applied by the loop itself, so no network callback ever
//! touches the queue lock directly.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rusty_sync_p2p::{PeerPool, SyncRole};
use rusty_sync_types::{short_hex, Block, BlockBodies, BlockHeader, BlockHeaders, GetBodies, Hash, PeerId};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::config::DownloaderConfig;
use crate::error::{TransportError, ValidationError};
use crate::network::{with_read_timeout, SyncNetwork};
use crate::queue::{BlockWithPeer, BlocksRequest, HeaderWithPeer, HeadersRequest, SyncQueue};
use crate::validation::{validate_body, HeaderValidator};

mod latch;

pub use latch::WakeLatch;

const PROGRESS_LOG_INTERVAL: Duration = Duration::from_secs(10);

struct HeaderResponse {
    peer: PeerId,
    request: HeadersRequest,
    result: Result<BlockHeaders, TransportError>,
    latency: Duration,
}

struct BodyResponse {
    peer: PeerId,
    headers: Vec<HeaderWithPeer>,
    result: Result<BlockBodies, TransportError>,
    latency: Duration,
}

/// Counters exposed for status reporting
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DownloaderStats {
    pub headers_received: u64,
    pub blocks_received: u64,
    pub blocks_exported: u64,
    pub invalid_responses: u64,
}

#[derive(Debug, Default)]
struct Counters {
    headers_received: AtomicU64,
    blocks_received: AtomicU64,
    blocks_exported: AtomicU64,
    invalid_responses: AtomicU64,
}

pub struct BlockDownloader<Q: SyncQueue> {
    name: &'static str,
    config: DownloaderConfig,
    queue: Mutex<Q>,
    pool: Arc<PeerPool>,
    network: Arc<dyn SyncNetwork>,
    validator: Arc<dyn HeaderValidator>,
    export_tx: mpsc::Sender<Vec<BlockWithPeer>>,
    header_latch: WakeLatch,
    body_latch: WakeLatch,
    sync_done: AtomicBool,
    headers_complete: AtomicBool,
    complete: watch::Sender<bool>,
    shutdown: watch::Sender<bool>,
    counters: Counters,
}

impl<Q: SyncQueue> BlockDownloader<Q> {
    /// Exported blocks are sent on `export_tx` in queue export order.
    pub fn new(
        name: &'static str,
        config: DownloaderConfig,
        queue: Q,
        pool: Arc<PeerPool>,
        network: Arc<dyn SyncNetwork>,
        validator: Arc<dyn HeaderValidator>,
        export_tx: mpsc::Sender<Vec<BlockWithPeer>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name,
            config,
            queue: Mutex::new(queue),
            pool,
            network,
            validator,
            export_tx,
            header_latch: WakeLatch::new(),
            body_latch: WakeLatch::new(),
            sync_done: AtomicBool::new(false),
            headers_complete: AtomicBool::new(false),
            complete: watch::channel(false).0,
            shutdown: watch::channel(false).0,
            counters: Counters::default(),
        })
    }

    /// Spawn the header and body loops.
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        info!(downloader = self.name, "Starting block downloader");
        vec![tokio::spawn(self.clone().header_loop()), tokio::spawn(self.clone().body_loop())]
    }

    /// Stop both loops; responses still in flight are ignored.
    pub fn stop(&self) {
        self.shutdown.send_replace(true);
        self.header_latch.wake();
        self.body_latch.wake();
    }

    pub fn is_stopped(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Mark whether the node has caught up; shortens the header wait.
    pub fn set_sync_done(&self, done: bool) {
        self.sync_done.store(done, Ordering::Relaxed);
    }

    pub fn is_sync_done(&self) -> bool {
        self.sync_done.load(Ordering::Relaxed)
    }

    /// Nudge both loops, e.g. after a new peer arrived.
    pub fn wake(&self) {
        self.header_latch.wake();
        self.body_latch.wake();
    }

    /// Whether the queue stopped asking for headers
    pub fn headers_complete(&self) -> bool {
        self.headers_complete.load(Ordering::Relaxed)
    }

    /// Resolve once the queue reports every wanted block exported.
    pub async fn wait_complete(&self) {
        let mut complete = self.complete.subscribe();
        let _ = complete.wait_for(|done| *done).await;
    }

    pub fn stats(&self) -> DownloaderStats {
        DownloaderStats {
            headers_received: self.counters.headers_received.load(Ordering::Relaxed),
            blocks_received: self.counters.blocks_received.load(Ordering::Relaxed),
            blocks_exported: self.counters.blocks_exported.load(Ordering::Relaxed),
            invalid_responses: self.counters.invalid_responses.load(Ordering::Relaxed),
        }
    }

    pub fn header_backlog(&self) -> usize {
        self.queue.lock().header_count()
    }

    /// Read-only access to the queue
    pub fn with_queue<R>(&self, f: impl FnOnce(&Q) -> R) -> R {
        f(&self.queue.lock())
    }

    fn report_invalid(&self, peer: PeerId, reason: &str) {
        self.counters.invalid_responses.fetch_add(1, Ordering::Relaxed);
        warn!(downloader = self.name, peer = %peer, reason, "Invalid data from peer");
        if let Err(e) = self.pool.report_invalid(peer) {
            debug!(peer = %peer, error = %e, "Could not penalise peer");
        }
    }

    fn check_headers(&self, headers: &mut [BlockHeader]) -> Result<(), ValidationError> {
        headers.sort_by_key(|h| h.number);
        for header in headers.iter() {
            self.validator.validate(header)?;
        }
        for pair in headers.windows(2) {
            if pair[1].number == pair[0].number + 1 && pair[1].parent_hash == pair[0].hash() {
                self.validator.validate_with_parent(&pair[1], &pair[0])?;
            }
        }
        Ok(())
    }

    /// Validate headers from `peer` and merge them into the queue.
    ///
    /// Returns false if the batch was rejected in full or in part.
    pub fn validate_and_add_headers(&self, headers: Vec<BlockHeader>, peer: PeerId) -> bool {
        self.check_and_merge(headers, peer).1
    }

    /// Number of headers added and whether the batch was accepted in full.
    fn check_and_merge(&self, mut headers: Vec<BlockHeader>, peer: PeerId) -> (usize, bool) {
        if headers.is_empty() {
            return (0, true);
        }
        if let Err(e) = self.check_headers(&mut headers) {
            self.report_invalid(peer, &e.to_string());
            return (0, false);
        }
        self.add_checked_headers(headers, peer)
    }

    fn add_checked_headers(&self, headers: Vec<BlockHeader>, peer: PeerId) -> (usize, bool) {
        let wrapped = headers.into_iter().map(|h| HeaderWithPeer::new(h.seal(), peer)).collect();
        let (added, invalid) = {
            let mut queue = self.queue.lock();
            let validated = queue.validate_headers(wrapped);
            let invalid = validated.invalid_peer.map(|bad| (bad, validated.reason.clone().unwrap_or_default()));
            (queue.add_headers(validated.headers).len(), invalid)
        };

        if added > 0 {
            self.counters.headers_received.fetch_add(added as u64, Ordering::Relaxed);
            self.body_latch.wake();
        }
        match invalid {
            Some((bad, reason)) => {
                self.report_invalid(bad, &reason);
                (added, false)
            }
            None => (added, true),
        }
    }

    /// Validate whole blocks and merge headers and bodies; `None` if rejected.
    async fn accept_blocks(&self, blocks: Vec<Block>, peer: PeerId) -> Option<usize> {
        let mut headers: Vec<BlockHeader> = blocks.iter().map(|b| b.header.clone()).collect();
        let checked = self
            .check_headers(&mut headers)
            .and_then(|_| blocks.iter().try_for_each(|b| validate_body(&b.header, &b.body)));
        if let Err(e) = checked {
            self.report_invalid(peer, &e.to_string());
            return None;
        }
        if !self.add_checked_headers(headers, peer).1 {
            return None;
        }
        self.counters.blocks_received.fetch_add(blocks.len() as u64, Ordering::Relaxed);
        Some(self.add_blocks(blocks).await)
    }

    /// Merge complete blocks from `peer`.
    ///
    /// Returns the number of blocks that became exportable.
    pub async fn add_list(&self, blocks: Vec<Block>, peer: PeerId) -> usize {
        self.accept_blocks(blocks, peer).await.unwrap_or(0)
    }

    /// Accept a single announced block; false if it failed validation.
    pub async fn validate_and_add_new_block(&self, block: Block, peer: PeerId) -> bool {
        debug!(downloader = self.name, number = block.number(), hash = %short_hex(&block.hash()), peer = %peer, "New block");
        self.accept_blocks(vec![block], peer).await.is_some()
    }

    async fn add_blocks(&self, blocks: Vec<Block>) -> usize {
        if blocks.is_empty() {
            return 0;
        }
        let exported = self.queue.lock().add_blocks(blocks);
        let count = exported.len();
        if count > 0 {
            self.counters.blocks_exported.fetch_add(count as u64, Ordering::Relaxed);
            if self.export_tx.send(exported).await.is_err() {
                warn!(downloader = self.name, "Export channel closed, dropping blocks");
            }
            self.header_latch.wake();
        }
        count
    }

    fn on_transport_error(&self, peer: PeerId, error: TransportError) {
        match error {
            TransportError::Timeout => {
                warn!(downloader = self.name, peer = %peer, "Peer did not answer in time, dropping");
                self.pool.drop_peer(peer);
            }
            other => {
                debug!(downloader = self.name, peer = %peer, error = %other, "Request failed");
                self.pool.release(peer);
            }
        }
    }

    fn spawn_header_request(&self, peer: PeerId, request: HeadersRequest, tx: mpsc::UnboundedSender<HeaderResponse>) {
        let network = self.network.clone();
        let timeout = self.config.read_timeout();
        self.pool.record_request(peer, request.count as usize);
        tokio::spawn(async move {
            let started = Instant::now();
            let result = with_read_timeout(timeout, network.get_headers(peer, request.to_message())).await;
            let _ = tx.send(HeaderResponse { peer, request, result, latency: started.elapsed() });
        });
    }

    /// Apply a header answer; returns the number of headers added.
    fn on_header_response(&self, response: HeaderResponse) -> usize {
        let HeaderResponse { peer, request, result, latency } = response;
        let added = match result {
            Ok(BlockHeaders { headers }) => {
                self.pool.record_response(peer, latency, headers.len());
                if headers.len() > request.count as usize {
                    self.report_invalid(peer, "more headers than requested");
                    0
                } else {
                    self.check_and_merge(headers, peer).0
                }
            }
            Err(e) => {
                self.on_transport_error(peer, e);
                0
            }
        };
        // the peer is free again and may serve bodies
        self.body_latch.wake();
        added
    }

    async fn header_loop(self: Arc<Self>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut shutdown = self.shutdown.subscribe();
        let mut outstanding: Vec<(HeadersRequest, PeerId)> = Vec::new();
        let mut last_log = Instant::now();

        while !*shutdown.borrow() {
            let requests = {
                let mut queue = self.queue.lock();
                if queue.header_count() < self.config.header_queue_limit {
                    queue.request_headers(
                        self.config.max_headers_per_request,
                        self.config.max_header_requests,
                        self.config.header_queue_limit,
                    )
                } else {
                    Some(Vec::new())
                }
            };
            let Some(requests) = requests else {
                info!(downloader = self.name, "Header retrieval complete");
                self.headers_complete.store(true, Ordering::Relaxed);
                self.body_latch.wake();
                break;
            };

            for request in requests {
                if outstanding.iter().any(|(sent, _)| *sent == request) {
                    continue;
                }
                let min_version = self.pool.config().min_protocol_version;
                let Some(peer) = self.pool.acquire_idle(SyncRole::HeaderRetrieving, min_version) else { break };
                debug!(downloader = self.name, peer = %peer.id(), start = ?request.start, count = request.count, reverse = request.reverse, "Requesting headers");
                outstanding.push((request.clone(), peer.id()));
                self.spawn_header_request(peer.id(), request, tx.clone());
            }

            if last_log.elapsed() >= PROGRESS_LOG_INTERVAL {
                info!(downloader = self.name, backlog = self.header_backlog(), in_flight = outstanding.len(), stats = ?self.stats(), "Header loop progress");
                last_log = Instant::now();
            }

            // only an answer that grew the queue cuts the wait short
            let deadline = Instant::now() + self.config.header_wait(self.is_sync_done());
            loop {
                tokio::select! {
                    Some(response) = rx.recv() => {
                        let answered = (response.request.clone(), response.peer);
                        if let Some(index) = outstanding.iter().position(|sent| *sent == answered) {
                            outstanding.swap_remove(index);
                        }
                        if self.on_header_response(response) > 0 {
                            break;
                        }
                    }
                    _ = self.header_latch.notified() => break,
                    _ = sleep_until(deadline) => break,
                    _ = shutdown.changed() => break,
                }
            }
        }
        for (_, peer) in outstanding {
            self.pool.release(peer);
        }
        debug!(downloader = self.name, "Header loop stopped");
    }

    fn spawn_body_request(&self, peer: PeerId, headers: Vec<HeaderWithPeer>, tx: mpsc::UnboundedSender<BodyResponse>) {
        let network = self.network.clone();
        let timeout = self.config.read_timeout();
        let request = GetBodies { hashes: headers.iter().map(HeaderWithPeer::hash).collect() };
        self.pool.record_request(peer, headers.len());
        tokio::spawn(async move {
            let started = Instant::now();
            let result = with_read_timeout(timeout, network.get_bodies(peer, request)).await;
            let _ = tx.send(BodyResponse { peer, headers, result, latency: started.elapsed() });
        });
    }

    async fn on_body_response(&self, response: BodyResponse) {
        let BodyResponse { peer, headers, result, latency } = response;
        let bodies = match result {
            Ok(BlockBodies { bodies }) => bodies,
            Err(e) => return self.on_transport_error(peer, e),
        };
        self.pool.record_response(peer, latency, bodies.len());
        if bodies.len() > headers.len() {
            self.report_invalid(peer, "more bodies than requested");
            return;
        }

        let mut blocks = Vec::with_capacity(bodies.len());
        for (header, body) in headers.iter().zip(bodies) {
            let header = header.header.header();
            if let Err(e) = validate_body(header, &body) {
                self.report_invalid(peer, &e.to_string());
                return;
            }
            blocks.push(Block::new(header.clone(), body));
        }
        self.counters.blocks_received.fetch_add(blocks.len() as u64, Ordering::Relaxed);
        self.add_blocks(blocks).await;
    }

    /// Pick peers for a body request: the header suppliers for small sets,
    /// otherwise every idle peer gets one batch.
    fn assign_body_requests(&self, request: BlocksRequest) -> Vec<(PeerId, Vec<HeaderWithPeer>)> {
        let min_version = self.pool.config().min_protocol_version;
        if request.len() <= self.config.small_body_set {
            let mut assigned = Vec::new();
            for header in request.headers {
                let peer = self
                    .pool
                    .acquire(header.peer, SyncRole::BlockRetrieving)
                    .or_else(|| self.pool.acquire_idle(SyncRole::BlockRetrieving, min_version));
                if let Some(peer) = peer {
                    assigned.push((peer.id(), vec![header]));
                }
            }
            return assigned;
        }

        let batches = request.split(self.config.max_bodies_per_request);
        let peers = self.pool.change_role_for_idles(SyncRole::BlockRetrieving);
        let mut peers = peers.into_iter();
        let mut assigned = Vec::new();
        for batch in batches {
            let Some(peer) = peers.next() else { break };
            assigned.push((peer.id(), batch.headers));
        }
        for unused in peers {
            self.pool.release(unused.id());
        }
        assigned
    }

    async fn body_loop(self: Arc<Self>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<BodyResponse>();
        let mut shutdown = self.shutdown.subscribe();
        let mut in_flight: HashSet<Hash> = HashSet::new();
        let mut busy: Vec<PeerId> = Vec::new();
        let mut last_log = Instant::now();

        while !*shutdown.borrow() {
            let (complete, request) = {
                let mut queue = self.queue.lock();
                let complete = queue.is_complete();
                let backlog = queue.body_count();
                let request = if complete || backlog >= self.config.body_queue_limit {
                    BlocksRequest::default()
                } else {
                    let room = self.config.body_queue_limit - backlog;
                    let mut wanted = queue.request_blocks(room + in_flight.len());
                    wanted.headers.retain(|h| !in_flight.contains(&h.hash()));
                    wanted.headers.truncate(room);
                    wanted
                };
                (complete, request)
            };
            if complete {
                info!(downloader = self.name, stats = ?self.stats(), "Block retrieval complete");
                self.complete.send_replace(true);
                break;
            }

            let mut issued = 0usize;
            if !request.is_empty() {
                for (peer, headers) in self.assign_body_requests(request) {
                    debug!(downloader = self.name, peer = %peer, count = headers.len(), "Requesting bodies");
                    in_flight.extend(headers.iter().map(HeaderWithPeer::hash));
                    busy.push(peer);
                    self.spawn_body_request(peer, headers, tx.clone());
                    issued += 1;
                }
            }

            if last_log.elapsed() >= PROGRESS_LOG_INTERVAL {
                info!(downloader = self.name, in_flight = in_flight.len(), stats = ?self.stats(), "Body loop progress");
                last_log = Instant::now();
            }

            // every batch has to answer or time out before the next poll
            let mut awaiting = issued.max(1);
            let deadline = Instant::now() + self.config.body_wait();
            loop {
                tokio::select! {
                    Some(response) = rx.recv() => {
                        for header in &response.headers {
                            in_flight.remove(&header.hash());
                        }
                        if let Some(index) = busy.iter().position(|p| *p == response.peer) {
                            busy.swap_remove(index);
                        }
                        self.on_body_response(response).await;
                        awaiting -= 1;
                        if awaiting == 0 {
                            break;
                        }
                    }
                    _ = self.body_latch.notified(), if issued == 0 => break,
                    _ = sleep_until(deadline) => break,
                    _ = shutdown.changed() => break,
                }
            }
        }
        // peers still waiting on an answer are handed back to the pool
        for peer in busy {
            self.pool.release(peer);
        }
        debug!(downloader = self.name, "Body loop stopped");
    }
}
