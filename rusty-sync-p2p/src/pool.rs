//! The peer pool used by every sync loop.
//!
//! All state sits behind one `parking_lot` mutex. Listener callbacks are
//! invoked after the lock is released so a listener may call back into the pool.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rusty_sync_types::{BlockNumber, Hash, PeerId, U256};
use tracing::{debug, info, warn};

use crate::config::PeerPoolConfig;
use crate::error::{PeerPoolError, PeerPoolResult};
use crate::peer::{Peer, PeerInfo, PeerStats, SyncRole};
use crate::peer_selection::{in_weight_range, SelectionPolicy};

/// Receives membership changes of the pool
pub trait PoolListener: Send + Sync {
    fn on_peer_added(&self, _info: &PeerInfo) {}
    fn on_peer_removed(&self, _peer: PeerId) {}
}

/// Outcome of reporting an invalid response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerPenalty {
    /// Reputation lowered, peer stays in the pool
    Warned,
    /// Peer moved to the banned set
    Banned,
}

/// Summary of one health sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Bans that expired during this sweep
    pub released: Vec<PeerId>,
    /// Released peers put straight back into the active set
    pub readmitted: Vec<PeerId>,
    pub pruned_pending: usize,
    pub active: usize,
    pub banned: usize,
    pub sync_peers: usize,
}

#[derive(Debug)]
struct BanEntry {
    until: Instant,
    /// Handshake info kept for automatic re-admission; `None` once the peer disconnected
    info: Option<PeerInfo>,
}

#[derive(Debug, Default)]
struct PoolInner {
    active: HashMap<PeerId, Peer>,
    banned: HashMap<PeerId, BanEntry>,
    disconnects: HashMap<PeerId, u32>,
    pending: HashMap<PeerId, Instant>,
    /// Peers eligible for outbound sync requests, fastest first
    sync_peers: Vec<PeerId>,
}

enum Event {
    Added(PeerInfo),
    Removed(PeerId),
}

/// Connected peers, their roles and their bans
pub struct PeerPool {
    config: PeerPoolConfig,
    policy: SelectionPolicy,
    inner: Mutex<PoolInner>,
    listener: Option<Arc<dyn PoolListener>>,
}

impl PeerPool {
    pub fn new(config: PeerPoolConfig) -> Self {
        let policy = SelectionPolicy::from(&config);
        Self { config, policy, inner: Mutex::new(PoolInner::default()), listener: None }
    }

    pub fn with_listener(config: PeerPoolConfig, listener: Arc<dyn PoolListener>) -> Self {
        let mut pool = Self::new(config);
        pool.listener = Some(listener);
        pool
    }

    pub fn config(&self) -> &PeerPoolConfig {
        &self.config
    }

    fn notify(&self, events: Vec<Event>) {
        let Some(listener) = &self.listener else { return };
        for event in events {
            match event {
                Event::Added(info) => listener.on_peer_added(&info),
                Event::Removed(peer) => listener.on_peer_removed(peer),
            }
        }
    }

    fn best_weight(inner: &PoolInner) -> Option<U256> {
        inner.active.values().map(Peer::weight).max()
    }

    fn recompute_sync_peers(&self, inner: &mut PoolInner) {
        let peers: Vec<&Peer> = inner.active.values().collect();
        inner.sync_peers = self.policy.select_sync_subset(&peers);
    }

    fn admit(&self, inner: &mut PoolInner, info: PeerInfo) -> PeerPoolResult<()> {
        let id = info.id;
        if info.protocol_version < self.config.min_protocol_version {
            return Err(PeerPoolError::ProtocolTooOld {
                peer: id,
                version: info.protocol_version,
                min: self.config.min_protocol_version,
            });
        }
        if inner.banned.contains_key(&id) {
            return Err(PeerPoolError::Banned(id));
        }
        if inner.active.contains_key(&id) {
            return Err(PeerPoolError::AlreadyConnected(id));
        }
        if let Some(best) = Self::best_weight(inner) {
            if !in_weight_range(info.total_difficulty, best, self.config.weight_range_percent) {
                return Err(PeerPoolError::WeightTooLow { peer: id, weight: info.total_difficulty, best });
            }
        }

        inner.pending.remove(&id);
        inner.active.insert(id, Peer::new(info));
        self.recompute_sync_peers(inner);
        Ok(())
    }

    /// Register a peer that finished its handshake.
    pub fn add(&self, info: PeerInfo) -> PeerPoolResult<()> {
        let added = info.clone();
        {
            let mut inner = self.inner.lock();
            if let Err(e) = self.admit(&mut inner, info) {
                debug!(peer = %added.id, error = %e, "Peer rejected");
                return Err(e);
            }
        }
        info!(peer = %added.id, address = %added.address, td = %added.total_difficulty, "Peer added");
        self.notify(vec![Event::Added(added)]);
        Ok(())
    }

    /// Remember an outbound connection attempt so a stale one can be pruned.
    pub fn note_pending_connection(&self, peer: PeerId) {
        self.note_pending_connection_at(peer, Instant::now());
    }

    pub fn note_pending_connection_at(&self, peer: PeerId, now: Instant) {
        let mut inner = self.inner.lock();
        if !inner.active.contains_key(&peer) {
            inner.pending.insert(peer, now);
        }
    }

    /// Handle a peer closing its connection.
    ///
    /// Returns true if the disconnect escalated to a ban.
    pub fn on_disconnect(&self, peer: PeerId) -> bool {
        let now = Instant::now();
        let banned;
        {
            let mut inner = self.inner.lock();
            inner.pending.remove(&peer);
            if inner.active.remove(&peer).is_none() {
                // a banned peer that went away must not come back on release
                if let Some(ban) = inner.banned.get_mut(&peer) {
                    ban.info = None;
                }
                return false;
            }
            let count = inner.disconnects.entry(peer).or_insert(0);
            *count += 1;
            banned = *count > self.config.max_disconnects;
            if banned {
                inner.disconnects.remove(&peer);
                inner.banned.insert(peer, BanEntry { until: now + self.config.ban_duration(), info: None });
            }
            self.recompute_sync_peers(&mut inner);
        }
        if banned {
            warn!(peer = %peer, "Peer banned for repeated disconnects");
        } else {
            debug!(peer = %peer, "Peer disconnected");
        }
        self.notify(vec![Event::Removed(peer)]);
        banned
    }

    /// Drop a peer that stopped answering; it is not banned and may reconnect.
    pub fn drop_peer(&self, peer: PeerId) -> Option<PeerStats> {
        let removed = {
            let mut inner = self.inner.lock();
            let removed = inner.active.remove(&peer);
            if removed.is_some() {
                self.recompute_sync_peers(&mut inner);
            }
            removed
        }?;
        info!(peer = %peer, timeouts = removed.stats.timeouts, "Dropped unresponsive peer");
        self.notify(vec![Event::Removed(peer)]);
        Some(removed.stats)
    }

    /// Update what a peer advertises as its best block.
    pub fn update_peer_head(
        &self,
        peer: PeerId,
        total_difficulty: U256,
        best_hash: Hash,
        best_number: Option<BlockNumber>,
    ) -> PeerPoolResult<()> {
        let mut inner = self.inner.lock();
        let entry = inner.active.get_mut(&peer).ok_or(PeerPoolError::UnknownPeer(peer))?;
        entry.info.total_difficulty = total_difficulty;
        entry.info.best_hash = best_hash;
        if best_number.is_some() {
            entry.info.best_number = best_number;
        }
        Ok(())
    }

    pub fn get_by_id(&self, peer: PeerId) -> Option<Peer> {
        self.inner.lock().active.get(&peer).cloned()
    }

    pub fn get_best_peer(&self) -> Option<Peer> {
        let inner = self.inner.lock();
        let peers: Vec<&Peer> = inner.active.values().collect();
        self.policy.select_best(&peers).cloned()
    }

    /// Take the fastest idle sync peer and assign it `role`.
    pub fn acquire_idle(&self, role: SyncRole, min_version: u8) -> Option<Peer> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let PoolInner { active, sync_peers, .. } = &mut *inner;
        let chosen = sync_peers
            .iter()
            .filter_map(|id| active.get(id))
            .filter(|p| p.is_idle() && p.info.protocol_version >= min_version)
            .min_by(|a, b| {
                a.stats
                    .avg_latency_ms
                    .partial_cmp(&b.stats.avg_latency_ms)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.id().cmp(&b.id()))
            })
            .map(Peer::id)?;
        let peer = active.get_mut(&chosen)?;
        peer.set_role(role, now);
        Some(peer.clone())
    }

    /// Assign `role` to a specific peer if it is idle.
    pub fn acquire(&self, peer: PeerId, role: SyncRole) -> Option<Peer> {
        let mut inner = self.inner.lock();
        let entry = inner.active.get_mut(&peer).filter(|p| p.is_idle())?;
        entry.set_role(role, Instant::now());
        Some(entry.clone())
    }

    /// Idle peers from the sync subset, fastest first.
    pub fn get_all_idle(&self) -> Vec<Peer> {
        let inner = self.inner.lock();
        inner.sync_peers.iter().filter_map(|id| inner.active.get(id)).filter(|p| p.is_idle()).cloned().collect()
    }

    /// Assign `role` to every idle sync peer and return them.
    pub fn change_role_for_idles(&self, role: SyncRole) -> Vec<Peer> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let PoolInner { active, sync_peers, .. } = &mut *inner;
        let mut assigned = Vec::new();
        for id in sync_peers.iter() {
            if let Some(peer) = active.get_mut(id).filter(|p| p.is_idle()) {
                peer.set_role(role, now);
                assigned.push(peer.clone());
            }
        }
        assigned
    }

    /// Return a peer to the idle state.
    pub fn release(&self, peer: PeerId) {
        if let Some(entry) = self.inner.lock().active.get_mut(&peer) {
            entry.set_role(SyncRole::Idle, Instant::now());
        }
    }

    pub fn record_request(&self, peer: PeerId, items: usize) {
        if let Some(entry) = self.inner.lock().active.get_mut(&peer) {
            entry.stats.requests += 1;
            entry.stats.nodes_requested += items as u64;
        }
    }

    /// Account a successful response and return the peer to idle.
    pub fn record_response(&self, peer: PeerId, latency: Duration, items: usize) {
        if let Some(entry) = self.inner.lock().active.get_mut(&peer) {
            entry.stats.record_success(latency);
            entry.stats.nodes_received += items as u64;
            entry.set_role(SyncRole::Idle, Instant::now());
        }
    }

    /// Account a request that was abandoned by its owner's timeout; diagnostic only.
    pub fn record_timeout(&self, peer: PeerId) {
        if let Some(entry) = self.inner.lock().active.get_mut(&peer) {
            entry.stats.record_timeout();
            entry.set_role(SyncRole::Idle, Instant::now());
        }
    }

    /// Penalise a peer that sent data failing validation.
    pub fn report_invalid(&self, peer: PeerId) -> PeerPoolResult<PeerPenalty> {
        let now = Instant::now();
        let penalty = {
            let mut inner = self.inner.lock();
            let entry = inner.active.get_mut(&peer).ok_or(PeerPoolError::UnknownPeer(peer))?;
            entry.stats.record_invalid();
            entry.set_role(SyncRole::Idle, now);
            if entry.stats.invalid_responses >= self.config.max_invalid_responses {
                self.ban_locked(&mut inner, peer, now);
                PeerPenalty::Banned
            } else {
                PeerPenalty::Warned
            }
        };
        match penalty {
            PeerPenalty::Banned => {
                warn!(peer = %peer, "Peer banned for invalid responses");
                self.notify(vec![Event::Removed(peer)]);
            }
            PeerPenalty::Warned => debug!(peer = %peer, "Invalid response reported"),
        }
        Ok(penalty)
    }

    fn ban_locked(&self, inner: &mut PoolInner, peer: PeerId, now: Instant) -> bool {
        let until = now + self.config.ban_duration();
        let was_active = match inner.active.remove(&peer) {
            Some(entry) => {
                let mut info = entry.info;
                info.best_number = None;
                inner.banned.insert(peer, BanEntry { until, info: Some(info) });
                true
            }
            None => {
                inner.banned.entry(peer).or_insert(BanEntry { until, info: None }).until = until;
                false
            }
        };
        inner.pending.remove(&peer);
        self.recompute_sync_peers(inner);
        was_active
    }

    /// Ban a peer for the configured cooldown.
    pub fn ban(&self, peer: PeerId) {
        self.ban_at(peer, Instant::now());
    }

    pub fn ban_at(&self, peer: PeerId, now: Instant) {
        let was_active = self.ban_locked(&mut self.inner.lock(), peer, now);
        info!(peer = %peer, secs = self.config.ban_duration_secs, "Peer banned");
        if was_active {
            self.notify(vec![Event::Removed(peer)]);
        }
    }

    pub fn is_banned(&self, peer: PeerId) -> bool {
        self.inner.lock().banned.contains_key(&peer)
    }

    pub fn sweep(&self) -> SweepReport {
        self.sweep_at(Instant::now())
    }

    /// Release expired bans, recompute the sync subset and prune stale
    /// pending connections.
    pub fn sweep_at(&self, now: Instant) -> SweepReport {
        let mut report = SweepReport::default();
        let mut events = Vec::new();
        {
            let mut inner = self.inner.lock();
            let expired: Vec<PeerId> =
                inner.banned.iter().filter(|(_, ban)| now >= ban.until).map(|(id, _)| *id).collect();
            for id in expired {
                let Some(ban) = inner.banned.remove(&id) else { continue };
                report.released.push(id);
                if let Some(info) = ban.info {
                    match self.admit(&mut inner, info.clone()) {
                        Ok(()) => {
                            report.readmitted.push(id);
                            events.push(Event::Added(info));
                        }
                        Err(e) => debug!(peer = %id, error = %e, "Released peer not re-admitted"),
                    }
                }
            }

            let timeout = self.config.connect_timeout();
            let before = inner.pending.len();
            inner.pending.retain(|_, started| now.saturating_duration_since(*started) < timeout);
            report.pruned_pending = before - inner.pending.len();

            self.recompute_sync_peers(&mut inner);
            report.active = inner.active.len();
            report.banned = inner.banned.len();
            report.sync_peers = inner.sync_peers.len();
        }
        debug!(
            active = report.active,
            banned = report.banned,
            sync = report.sync_peers,
            released = report.released.len(),
            pruned = report.pruned_pending,
            "Peer pool sweep"
        );
        self.notify(events);
        report
    }

    pub fn active_count(&self) -> usize {
        self.inner.lock().active.len()
    }

    pub fn banned_count(&self) -> usize {
        self.inner.lock().banned.len()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock().pending.len()
    }

    pub fn sync_peers(&self) -> Vec<PeerId> {
        self.inner.lock().sync_peers.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn info(seed: u8, weight: u64) -> PeerInfo {
        PeerInfo::new(
            PeerId([seed; 32]),
            format!("10.0.0.{}:30303", seed).parse().unwrap(),
            U256::from(weight),
            [seed; 32],
            63,
        )
    }

    fn pool() -> PeerPool {
        PeerPool::new(PeerPoolConfig::default())
    }

    #[test]
    fn test_add_rejects_light_peer() {
        let pool = pool();
        pool.add(info(1, 1000)).unwrap();
        let err = pool.add(info(2, 700)).unwrap_err();
        assert!(matches!(err, PeerPoolError::WeightTooLow { .. }));
        pool.add(info(3, 800)).unwrap();
        assert_eq!(pool.active_count(), 2);
    }

    #[test]
    fn test_add_rejects_duplicates_and_old_protocol() {
        let pool = pool();
        pool.add(info(1, 1000)).unwrap();
        assert_eq!(pool.add(info(1, 1000)), Err(PeerPoolError::AlreadyConnected(PeerId([1; 32]))));
        let mut old = info(2, 1000);
        old.protocol_version = 61;
        assert!(matches!(pool.add(old), Err(PeerPoolError::ProtocolTooOld { .. })));
    }

    #[test]
    fn test_acquire_idle_assigns_role_until_released() {
        let pool = pool();
        pool.add(info(1, 1000)).unwrap();
        let peer = pool.acquire_idle(SyncRole::HeaderRetrieving, 62).unwrap();
        assert_eq!(peer.role, SyncRole::HeaderRetrieving);
        assert!(pool.acquire_idle(SyncRole::BlockRetrieving, 62).is_none());
        pool.release(peer.id());
        assert!(pool.acquire_idle(SyncRole::BlockRetrieving, 62).is_some());
    }

    #[test]
    fn test_change_role_for_idles() {
        let pool = pool();
        for seed in 1..=4 {
            pool.add(info(seed, 1000)).unwrap();
        }
        pool.acquire(PeerId([1; 32]), SyncRole::HeaderRetrieving).unwrap();
        let assigned = pool.change_role_for_idles(SyncRole::BlockRetrieving);
        assert_eq!(assigned.len(), 3);
        assert!(pool.get_all_idle().is_empty());
    }

    #[test]
    fn test_ban_expires_exactly_after_duration() {
        let pool = pool();
        pool.add(info(1, 1000)).unwrap();
        let t = Instant::now();
        pool.ban_at(PeerId([1; 32]), t);
        assert_eq!(pool.active_count(), 0);
        assert!(pool.is_banned(PeerId([1; 32])));

        let report = pool.sweep_at(t + Duration::from_secs(59));
        assert!(report.released.is_empty());
        assert!(pool.get_best_peer().is_none());

        let report = pool.sweep_at(t + Duration::from_secs(60));
        assert_eq!(report.readmitted, vec![PeerId([1; 32])]);
        assert_eq!(pool.get_best_peer().unwrap().id(), PeerId([1; 32]));
        assert!(!pool.is_banned(PeerId([1; 32])));
    }

    #[test]
    fn test_banned_peer_that_disconnected_is_not_readmitted() {
        let pool = pool();
        let id = PeerId([1; 32]);
        pool.add(info(1, 1000)).unwrap();
        let t = Instant::now();
        pool.ban_at(id, t);

        assert!(!pool.on_disconnect(id));
        assert!(pool.is_banned(id));

        let report = pool.sweep_at(t + Duration::from_secs(60));
        assert_eq!(report.released, vec![id]);
        assert!(report.readmitted.is_empty());
        assert_eq!(report.active, 0);
        assert!(pool.get_by_id(id).is_none());
        // it may still reconnect through a fresh handshake
        pool.add(info(1, 1000)).unwrap();
        assert_eq!(pool.active_count(), 1);
    }

    #[test]
    fn test_banned_peer_cannot_rejoin() {
        let pool = pool();
        pool.ban(PeerId([9; 32]));
        assert_eq!(pool.add(info(9, 1000)), Err(PeerPoolError::Banned(PeerId([9; 32]))));
    }

    #[test]
    fn test_repeated_disconnects_escalate_to_ban() {
        let pool = pool();
        let id = PeerId([1; 32]);
        for _ in 0..5 {
            pool.add(info(1, 1000)).unwrap();
            assert!(!pool.on_disconnect(id));
        }
        pool.add(info(1, 1000)).unwrap();
        assert!(pool.on_disconnect(id));
        assert!(pool.is_banned(id));
        assert_eq!(pool.active_count(), 0);
        // unknown peers do not count
        assert!(!pool.on_disconnect(PeerId([7; 32])));
    }

    #[test]
    fn test_invalid_responses_escalate_to_ban() {
        let pool = pool();
        let id = PeerId([1; 32]);
        pool.add(info(1, 1000)).unwrap();
        assert_eq!(pool.report_invalid(id), Ok(PeerPenalty::Warned));
        assert_eq!(pool.report_invalid(id), Ok(PeerPenalty::Warned));
        assert_eq!(pool.report_invalid(id), Ok(PeerPenalty::Banned));
        assert!(pool.is_banned(id));
        assert_eq!(pool.report_invalid(id), Err(PeerPoolError::UnknownPeer(id)));
    }

    #[test]
    fn test_drop_peer_does_not_ban() {
        let pool = pool();
        let id = PeerId([1; 32]);
        pool.add(info(1, 1000)).unwrap();
        pool.record_timeout(id);
        let stats = pool.drop_peer(id).unwrap();
        assert_eq!(stats.timeouts, 1);
        assert!(!pool.is_banned(id));
        pool.add(info(1, 1000)).unwrap();
    }

    #[test]
    fn test_sweep_prunes_stale_pending_connections() {
        let pool = pool();
        let t = Instant::now();
        pool.note_pending_connection_at(PeerId([1; 32]), t);
        pool.note_pending_connection_at(PeerId([2; 32]), t + Duration::from_secs(8));
        let report = pool.sweep_at(t + Duration::from_secs(11));
        assert_eq!(report.pruned_pending, 1);
        assert_eq!(pool.pending_count(), 1);
    }

    #[test]
    fn test_listener_sees_membership_changes() {
        #[derive(Default)]
        struct Counter {
            added: AtomicUsize,
            removed: AtomicUsize,
        }
        impl PoolListener for Counter {
            fn on_peer_added(&self, _info: &PeerInfo) {
                self.added.fetch_add(1, Ordering::SeqCst);
            }
            fn on_peer_removed(&self, _peer: PeerId) {
                self.removed.fetch_add(1, Ordering::SeqCst);
            }
        }

        let counter = Arc::new(Counter::default());
        let pool = PeerPool::with_listener(PeerPoolConfig::default(), counter.clone());
        pool.add(info(1, 1000)).unwrap();
        pool.add(info(2, 1000)).unwrap();
        pool.ban(PeerId([1; 32]));
        pool.on_disconnect(PeerId([2; 32]));
        assert_eq!(counter.added.load(Ordering::SeqCst), 2);
        assert_eq!(counter.removed.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_active_and_banned_stay_disjoint() {
        let pool = pool();
        pool.add(info(1, 1000)).unwrap();
        pool.ban(PeerId([1; 32]));
        pool.ban(PeerId([1; 32]));
        assert_eq!(pool.active_count(), 0);
        assert_eq!(pool.banned_count(), 1);
        assert!(pool.get_by_id(PeerId([1; 32])).is_none());
    }
}
