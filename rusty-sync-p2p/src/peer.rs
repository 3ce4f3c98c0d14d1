use std::net::SocketAddr;
use std::time::{Duration, Instant};

use rusty_sync_types::{BlockNumber, Hash, PeerId, U256};
use serde::{Deserialize, Serialize};

/// What a peer is currently doing for the sync engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncRole {
    /// Available for any request
    Idle,
    /// Serving a header request
    HeaderRetrieving,
    /// Serving a body request
    BlockRetrieving,
    /// Serving a trie node or receipts request
    NodeRetrieving,
    /// Driving a targeted gap-recovery fetch
    Master,
}

/// Handshake-time facts about a peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub id: PeerId,
    pub address: SocketAddr,
    /// Advertised total difficulty of the peer's best chain
    pub total_difficulty: U256,
    pub best_hash: Hash,
    /// Best block number, once learned from an announcement
    pub best_number: Option<BlockNumber>,
    pub protocol_version: u8,
}

impl PeerInfo {
    pub fn new(id: PeerId, address: SocketAddr, total_difficulty: U256, best_hash: Hash, protocol_version: u8) -> Self {
        Self { id, address, total_difficulty, best_hash, best_number: None, protocol_version }
    }
}

/// Rolling request statistics for a peer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerStats {
    /// Base reputation score (-100 to 100)
    pub reputation: i32,
    /// Exponential moving average of response latency in milliseconds
    pub avg_latency_ms: f64,
    pub requests: u64,
    pub responses: u64,
    /// Diagnostic only; timeouts never ban
    pub timeouts: u64,
    pub invalid_responses: u32,
    pub nodes_requested: u64,
    pub nodes_received: u64,
    #[serde(skip, default = "Instant::now")]
    pub last_seen: Instant,
}

impl Default for PeerStats {
    fn default() -> Self {
        Self {
            reputation: 0,
            avg_latency_ms: 0.0,
            requests: 0,
            responses: 0,
            timeouts: 0,
            invalid_responses: 0,
            nodes_requested: 0,
            nodes_received: 0,
            last_seen: Instant::now(),
        }
    }
}

impl PeerStats {
    /// Update stats based on a successful response
    pub fn record_success(&mut self, latency: Duration) {
        let latency_ms = latency.as_secs_f64() * 1000.0;
        self.reputation = (self.reputation + 1).min(100);
        self.avg_latency_ms = if self.responses == 0 {
            latency_ms
        } else {
            self.avg_latency_ms * 0.9 + latency_ms * 0.1
        };
        self.responses += 1;
        self.last_seen = Instant::now();
    }

    pub fn record_timeout(&mut self) {
        self.timeouts += 1;
        self.reputation = (self.reputation - 1).max(-100);
    }

    /// Update stats based on a response that failed validation
    pub fn record_invalid(&mut self) {
        self.invalid_responses += 1;
        self.reputation = (self.reputation - 5).max(-100);
    }
}

/// A peer registered in the pool
#[derive(Debug, Clone)]
pub struct Peer {
    pub info: PeerInfo,
    pub role: SyncRole,
    pub stats: PeerStats,
    pub connected_at: Instant,
    /// When the current role was assigned, if not idle
    pub busy_since: Option<Instant>,
}

impl Peer {
    pub fn new(info: PeerInfo) -> Self {
        Self { info, role: SyncRole::Idle, stats: PeerStats::default(), connected_at: Instant::now(), busy_since: None }
    }

    pub fn id(&self) -> PeerId {
        self.info.id
    }

    pub fn weight(&self) -> U256 {
        self.info.total_difficulty
    }

    pub fn is_idle(&self) -> bool {
        self.role == SyncRole::Idle
    }

    pub fn set_role(&mut self, role: SyncRole, now: Instant) {
        self.role = role;
        self.busy_since = if role == SyncRole::Idle { None } else { Some(now) };
    }
}
