//! Top-level sync coordinator.
//!
//! The manager owns the long-lived tasks (pool sweep, block import, event
//! handling, fast sync) and switches between bulk catch-up and head following.
//! Mode changes go through [`transition`], a pure function over a snapshot of
//! the engine, and the returned actions are carried out afterwards.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rusty_sync_p2p::{spawn_sweep, PeerInfo, PeerPool, SyncRole};
use rusty_sync_types::{
    short_hex, Block, BlockBodies, BlockHeaders, BlockNumber, GetBodies, GetHeaders, Hash, PeerId, SealedHeader, U256,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::chain::{ChainStore, ImportResult, StateStore, SyncListener};
use crate::config::{SyncConfig, SyncManagerConfig};
use crate::downloader::{BlockDownloader, DownloaderStats};
use crate::error::{SyncError, SyncResult, TransportError};
use crate::network::{with_read_timeout, SyncNetwork};
use crate::queue::reverse::check_descending;
use crate::queue::{BlockWithPeer, DagSyncQueue};
use crate::state::{FastSyncManager, FastSyncPhase, FastSyncStats, TrieNodeDecoder};
use crate::validation::{validate_body, HeaderValidator};

/// Sync mode of the node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncMode {
    /// Bulk catch-up, including fast sync
    LongSync,
    /// Following the live head
    ShortSync,
}

/// Inputs to the mode state machine
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// A peer announced a head at this height
    BestKnownUpdated(BlockNumber),
    /// The importer rejected a block because its parent is unknown
    NoParent { block: Block, peer: Option<PeerId> },
    GapRecovered,
    /// The peer driving gap recovery failed to deliver
    MasterStuck { peer: PeerId },
    FastSyncDone { success: bool },
}

/// What [`transition`] looks at besides the event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncSnapshot {
    pub local_best: BlockNumber,
    pub best_known: BlockNumber,
    pub gap_recovery: bool,
    pub fast_sync_running: bool,
    pub active_peers: usize,
}

/// Side effects requested by [`transition`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncAction {
    StartBlockSync,
    StartGapRecovery { peer: PeerId, block: Block },
    DropOrphan { number: BlockNumber, hash: Hash },
    BanPeer(PeerId),
    NotifySyncDone(SyncMode),
}

/// Next mode and the actions to take for `event`.
pub fn transition(
    mode: SyncMode,
    event: &SyncEvent,
    snapshot: &SyncSnapshot,
    config: &SyncManagerConfig,
) -> (SyncMode, Vec<SyncAction>) {
    match event {
        SyncEvent::BestKnownUpdated(best_known) => {
            let gap = best_known.saturating_sub(snapshot.local_best);
            match mode {
                SyncMode::LongSync
                    if snapshot.active_peers > 0
                        && !snapshot.fast_sync_running
                        && gap <= config.forward_switch_threshold =>
                {
                    (SyncMode::ShortSync, vec![SyncAction::NotifySyncDone(SyncMode::LongSync)])
                }
                SyncMode::ShortSync if gap > config.backward_switch_threshold => (SyncMode::LongSync, Vec::new()),
                _ => (mode, Vec::new()),
            }
        }
        SyncEvent::NoParent { block, peer } => {
            let drop = SyncAction::DropOrphan { number: block.number(), hash: block.hash() };
            match (mode, peer) {
                (SyncMode::ShortSync, Some(peer)) if !snapshot.gap_recovery => {
                    (mode, vec![SyncAction::StartGapRecovery { peer: *peer, block: block.clone() }])
                }
                _ => (mode, vec![drop]),
            }
        }
        SyncEvent::GapRecovered => (mode, Vec::new()),
        SyncEvent::MasterStuck { peer } => (mode, vec![SyncAction::BanPeer(*peer)]),
        SyncEvent::FastSyncDone { .. } => (SyncMode::LongSync, vec![SyncAction::StartBlockSync]),
    }
}

/// Snapshot for outward reporting
#[derive(Debug, Clone, Serialize)]
pub struct SyncStatus {
    pub mode: SyncMode,
    pub local_best: BlockNumber,
    pub best_known: BlockNumber,
    pub gap_recovery: bool,
    pub active_peers: usize,
    pub banned_peers: usize,
    pub fast_sync_phase: Option<FastSyncPhase>,
    pub fast_sync: Option<FastSyncStats>,
    pub downloader: Option<DownloaderStats>,
}

/// Collaborators the manager drives
#[derive(Clone)]
pub struct SyncContext {
    pub pool: Arc<PeerPool>,
    pub network: Arc<dyn SyncNetwork>,
    pub chain: Arc<dyn ChainStore>,
    pub state: Arc<dyn StateStore>,
    pub decoder: Arc<dyn TrieNodeDecoder>,
    pub validator: Arc<dyn HeaderValidator>,
    pub listener: Option<Arc<dyn SyncListener>>,
}

pub struct SyncManager {
    config: SyncConfig,
    ctx: SyncContext,
    mode: Mutex<SyncMode>,
    best_known: AtomicU64,
    gap_recovery: AtomicBool,
    downloader: Mutex<Option<Arc<BlockDownloader<DagSyncQueue>>>>,
    fast_sync: Option<Arc<FastSyncManager>>,
    events: mpsc::UnboundedSender<SyncEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<SyncEvent>>>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncManager {
    pub fn new(config: SyncConfig, ctx: SyncContext) -> Arc<Self> {
        let fast_sync = config.fast_sync.enabled.then(|| {
            FastSyncManager::new(
                config.fast_sync.clone(),
                config.downloader.clone(),
                ctx.pool.clone(),
                ctx.network.clone(),
                ctx.chain.clone(),
                ctx.state.clone(),
                ctx.decoder.clone(),
                ctx.validator.clone(),
            )
        });
        let (events, events_rx) = mpsc::unbounded_channel();
        let local_best = ctx.chain.best_number();
        Arc::new(Self {
            config,
            ctx,
            mode: Mutex::new(SyncMode::LongSync),
            best_known: AtomicU64::new(local_best),
            gap_recovery: AtomicBool::new(false),
            downloader: Mutex::new(None),
            fast_sync,
            events,
            events_rx: Mutex::new(Some(events_rx)),
            shutdown: watch::channel(false).0,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn mode(&self) -> SyncMode {
        *self.mode.lock()
    }

    pub fn fast_sync(&self) -> Option<&Arc<FastSyncManager>> {
        self.fast_sync.as_ref()
    }

    /// Start the sweep, event handling and either fast sync or block sync.
    pub fn start(self: &Arc<Self>) {
        let Some(events_rx) = self.events_rx.lock().take() else {
            warn!("Sync manager already started");
            return;
        };
        info!(best = self.ctx.chain.best_number(), fast_sync = self.fast_sync.is_some(), "Starting sync manager");

        let mut tasks = vec![
            spawn_sweep(self.ctx.pool.clone(), self.shutdown.subscribe()),
            tokio::spawn(self.clone().event_loop(events_rx)),
            tokio::spawn(self.clone().status_loop()),
        ];

        match &self.fast_sync {
            Some(fast_sync) if self.ctx.chain.best_number() == 0 => {
                fast_sync.start_fast_sync(None);
                let fast_sync = fast_sync.clone();
                let events = self.events.clone();
                tasks.push(tokio::spawn(async move {
                    let success = fast_sync.wait_finished().await;
                    let _ = events.send(SyncEvent::FastSyncDone { success });
                }));
            }
            _ => self.start_block_sync(),
        }
        self.tasks.lock().extend(tasks);
    }

    /// Stop every task; fast sync is closed with its bounded join.
    pub async fn stop(&self) {
        info!("Stopping sync manager");
        self.shutdown.send_replace(true);
        let downloader = self.downloader.lock().take();
        if let Some(downloader) = downloader {
            downloader.stop();
        }
        if let Some(fast_sync) = &self.fast_sync {
            if let Err(e) = fast_sync.close().await {
                warn!(error = %e, "Fast sync did not close cleanly");
            }
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    /// Register a peer that finished its handshake.
    pub fn add_peer(&self, info: PeerInfo) -> SyncResult<()> {
        let best_number = info.best_number.unwrap_or(0);
        self.ctx.pool.add(info)?;
        self.note_best_known(best_number);
        self.wake_downloader();
        Ok(())
    }

    pub fn remove_peer(&self, peer: PeerId) {
        self.ctx.pool.on_disconnect(peer);
    }

    /// A peer announced a new head.
    pub fn on_peer_head(&self, peer: PeerId, total_difficulty: U256, best_hash: Hash, best_number: BlockNumber) {
        if let Err(e) = self.ctx.pool.update_peer_head(peer, total_difficulty, best_hash, Some(best_number)) {
            debug!(peer = %peer, error = %e, "Head update for unknown peer");
            return;
        }
        self.note_best_known(best_number);
    }

    /// A peer relayed a freshly mined block.
    pub async fn on_new_block(&self, block: Block, peer: PeerId) -> bool {
        self.note_best_known(block.number());
        let downloader = self.downloader.lock().clone();
        match downloader {
            Some(downloader) => downloader.validate_and_add_new_block(block, peer).await,
            None => {
                debug!(number = block.number(), "Block sync not running, ignoring new block");
                false
            }
        }
    }

    /// Headers pushed by a peer outside of a request.
    pub fn on_headers(&self, headers: Vec<SealedHeader>, peer: PeerId) -> bool {
        let downloader = self.downloader.lock().clone();
        match downloader {
            Some(downloader) => downloader.validate_and_add_headers(headers.into_iter().map(SealedHeader::into_header).collect(), peer),
            None => false,
        }
    }

    pub fn status(&self) -> SyncStatus {
        let downloader = self.downloader.lock().as_ref().map(|d| d.stats());
        SyncStatus {
            mode: self.mode(),
            local_best: self.ctx.chain.best_number(),
            best_known: self.best_known.load(Ordering::Relaxed),
            gap_recovery: self.gap_recovery.load(Ordering::Relaxed),
            active_peers: self.ctx.pool.active_count(),
            banned_peers: self.ctx.pool.banned_count(),
            fast_sync_phase: self.fast_sync.as_ref().map(|f| f.phase()),
            fast_sync: self.fast_sync.as_ref().map(|f| f.stats()),
            downloader,
        }
    }

    fn snapshot(&self) -> SyncSnapshot {
        SyncSnapshot {
            local_best: self.ctx.chain.best_number(),
            best_known: self.best_known.load(Ordering::Relaxed),
            gap_recovery: self.gap_recovery.load(Ordering::Relaxed),
            fast_sync_running: self.fast_sync.as_ref().map_or(false, |f| {
                !matches!(f.phase(), FastSyncPhase::Idle) && !f.phase().is_finished()
            }),
            active_peers: self.ctx.pool.active_count(),
        }
    }

    fn note_best_known(&self, number: BlockNumber) {
        let best = self.best_known.fetch_max(number, Ordering::Relaxed).max(number);
        let _ = self.events.send(SyncEvent::BestKnownUpdated(best));
    }

    fn wake_downloader(&self) {
        if let Some(downloader) = self.downloader.lock().as_ref() {
            downloader.wake();
        }
    }

    /// Apply `event` to the mode state machine and carry out the resulting actions.
    pub fn handle_event(self: &Arc<Self>, event: SyncEvent) {
        let snapshot = self.snapshot();
        let (previous, next, actions) = {
            let mut mode = self.mode.lock();
            let previous = *mode;
            let (next, actions) = transition(previous, &event, &snapshot, &self.config.manager);
            *mode = next;
            (previous, next, actions)
        };

        if previous != next {
            info!(from = ?previous, to = ?next, local = snapshot.local_best, best_known = snapshot.best_known, "Sync mode changed");
            if let Some(downloader) = self.downloader.lock().as_ref() {
                downloader.set_sync_done(next == SyncMode::ShortSync);
            }
        }
        for action in actions {
            self.apply(action);
        }
    }

    fn apply(self: &Arc<Self>, action: SyncAction) {
        match action {
            SyncAction::StartBlockSync => self.start_block_sync(),
            SyncAction::StartGapRecovery { peer, block } => {
                self.gap_recovery.store(true, Ordering::Relaxed);
                let manager = self.clone();
                let task = tokio::spawn(async move {
                    let event = match manager.recover_gap(peer, block).await {
                        Ok(imported) => {
                            info!(peer = %peer, imported, "Gap recovered");
                            SyncEvent::GapRecovered
                        }
                        Err(e) => {
                            warn!(peer = %peer, error = %e, "Gap recovery failed");
                            SyncEvent::MasterStuck { peer }
                        }
                    };
                    manager.gap_recovery.store(false, Ordering::Relaxed);
                    manager.handle_event(event);
                });
                self.tasks.lock().push(task);
            }
            SyncAction::DropOrphan { number, hash } => {
                debug!(number, hash = %short_hex(&hash), "Dropping orphan block");
            }
            SyncAction::BanPeer(peer) => {
                warn!(peer = %peer, "Banning stuck master peer");
                self.ctx.pool.ban(peer);
                self.ctx.network.disconnect(peer);
            }
            SyncAction::NotifySyncDone(mode) => {
                info!(mode = ?mode, best = self.ctx.chain.best_number(), "Sync done");
                if let Some(listener) = &self.ctx.listener {
                    listener.on_sync_done(mode);
                }
            }
        }
    }

    fn start_block_sync(self: &Arc<Self>) {
        let sync_done = self.mode() == SyncMode::ShortSync;
        let mut slot = self.downloader.lock();
        if slot.is_some() {
            return;
        }
        let best = self.ctx.chain.best_header();
        info!(from = best.number(), hash = %short_hex(&best.hash()), "Starting block sync");

        let (tx, rx) = mpsc::channel(self.config.downloader.export_channel_capacity);
        let queue = DagSyncQueue::new(best, &self.config.queue);
        let downloader = BlockDownloader::new(
            "blocks",
            self.config.downloader.clone(),
            queue,
            self.ctx.pool.clone(),
            self.ctx.network.clone(),
            self.ctx.validator.clone(),
            tx,
        );
        downloader.set_sync_done(sync_done);
        let mut tasks = downloader.start();
        tasks.push(tokio::spawn(self.clone().import_loop(rx)));
        *slot = Some(downloader);
        drop(slot);
        self.tasks.lock().extend(tasks);
    }

    async fn import_loop(self: Arc<Self>, mut rx: mpsc::Receiver<Vec<BlockWithPeer>>) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            let batch = tokio::select! {
                batch = rx.recv() => batch,
                _ = shutdown.changed() => None,
            };
            let Some(batch) = batch else { break };
            for BlockWithPeer { block, peer } in batch {
                self.import_one(block, peer);
            }
            if self.mode() == SyncMode::LongSync {
                let _ = self.events.send(SyncEvent::BestKnownUpdated(self.best_known.load(Ordering::Relaxed)));
            }
        }
        debug!("Import loop stopped");
    }

    fn import_one(&self, block: Block, peer: Option<PeerId>) {
        match self.ctx.chain.import_block(&block) {
            ImportResult::ImportedBest | ImportResult::ImportedNotBest | ImportResult::Exists => {}
            ImportResult::NoParent => {
                debug!(number = block.number(), hash = %short_hex(&block.hash()), "Imported block has no parent");
                let _ = self.events.send(SyncEvent::NoParent { block, peer });
            }
            ImportResult::Invalid => {
                warn!(number = block.number(), hash = %short_hex(&block.hash()), "Block rejected by importer");
                if let Some(peer) = peer {
                    if let Err(e) = self.ctx.pool.report_invalid(peer) {
                        debug!(peer = %peer, error = %e, "Could not penalise peer");
                    }
                }
            }
        }
    }

    async fn event_loop(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<SyncEvent>) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            let event = tokio::select! {
                event = events.recv() => event,
                _ = shutdown.changed() => None,
            };
            let Some(event) = event else { break };
            self.handle_event(event);
        }
    }

    async fn status_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut ticker = interval(Duration::from_secs(self.config.manager.status_log_secs.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let status = self.status();
                    info!(
                        mode = ?status.mode,
                        local = status.local_best,
                        best_known = status.best_known,
                        peers = status.active_peers,
                        banned = status.banned_peers,
                        "Sync status"
                    );
                }
                _ = shutdown.changed() => break,
            }
        }
    }

    /// Fetch the blocks between the local chain and `orphan` from `peer` and import them.
    async fn recover_gap(&self, peer: PeerId, orphan: Block) -> SyncResult<usize> {
        if self.ctx.pool.acquire(peer, SyncRole::Master).is_none() {
            debug!(peer = %peer, number = orphan.number(), "Master peer busy or gone, dropping orphan");
            return Ok(0);
        }
        let timeout = self.config.manager.gap_recovery_timeout();
        let result = match tokio::time::timeout(timeout, self.fetch_gap(peer, &orphan)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout.into()),
        };
        self.ctx.pool.release(peer);
        result
    }

    async fn fetch_gap(&self, peer: PeerId, orphan: &Block) -> SyncResult<usize> {
        let local = self.ctx.chain.best_number();
        let missing = orphan.number().saturating_sub(local + 1).max(1);
        let count = missing.min(u64::from(self.config.manager.gap_recovery_max_headers)) as u32;
        info!(peer = %peer, orphan = orphan.number(), local, count, "Starting gap recovery");

        let request = GetHeaders::by_hash(orphan.parent_hash(), count, true);
        let read_timeout = self.config.downloader.read_timeout();
        let BlockHeaders { headers } = with_read_timeout(read_timeout, self.ctx.network.get_headers(peer, request)).await?;
        let mut headers: Vec<SealedHeader> = headers.into_iter().map(|h| h.seal()).collect();
        headers.sort_by(|a, b| b.number().cmp(&a.number()));

        let (linked, broken) = check_descending(orphan.parent_hash(), &headers);
        if let Some(e) = broken {
            return Err(e.into());
        }
        if linked == 0 {
            return Err(TransportError::EmptyResponse.into());
        }
        for header in &headers {
            self.ctx.validator.validate(header.header())?;
        }

        let hashes = headers.iter().map(SealedHeader::hash).collect();
        let BlockBodies { bodies } = with_read_timeout(read_timeout, self.ctx.network.get_bodies(peer, GetBodies { hashes })).await?;
        if bodies.len() != headers.len() {
            return Err(TransportError::EmptyResponse.into());
        }

        let mut blocks = Vec::with_capacity(headers.len() + 1);
        for (header, body) in headers.into_iter().zip(bodies) {
            validate_body(header.header(), &body)?;
            blocks.push(Block::new(header.into_header(), body));
        }
        blocks.reverse();
        blocks.push(orphan.clone());

        let mut imported = 0;
        for block in &blocks {
            match self.ctx.chain.import_block(block) {
                result if result.is_success() => imported += 1,
                ImportResult::NoParent if imported == 0 => {
                    // deeper than one fetch; the downloader keeps filling the rest
                    debug!(number = block.number(), "Gap reaches below the fetched range");
                    return Ok(0);
                }
                other => {
                    error!(number = block.number(), result = ?other, "Gap block import failed");
                    return Err(SyncError::Store(format!("block {} import: {other:?}", block.number())));
                }
            }
        }
        Ok(imported)
    }
}
