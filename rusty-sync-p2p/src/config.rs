use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for the peer pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerPoolConfig {
    /// Maximum number of peers used for outbound sync requests
    pub sync_peer_count: usize,
    /// A peer is usable only if its weight is within this percentage of the best weight
    pub weight_range_percent: u8,
    /// Oldest protocol version accepted into the pool
    pub min_protocol_version: u8,
    /// Protocol version preferred by best-peer selection
    pub preferred_protocol_version: u8,
    /// Minimum number of preferred-protocol peers before legacy peers are ignored
    pub min_preferred_peers: usize,
    /// Peers slower than this average latency are left out of the sync subset
    pub max_avg_latency_ms: u64,
    /// Ban cooldown (in seconds)
    pub ban_duration_secs: u64,
    /// Disconnects tolerated in a session before a peer gets banned
    pub max_disconnects: u32,
    /// Invalid responses tolerated before a peer gets banned
    pub max_invalid_responses: u32,
    /// Pending connection attempts older than this are pruned (in seconds)
    pub connect_timeout_secs: u64,
    /// Interval between health sweeps (in milliseconds)
    pub sweep_interval_ms: u64,
}

impl Default for PeerPoolConfig {
    fn default() -> Self {
        Self {
            sync_peer_count: 32,
            weight_range_percent: 20,
            min_protocol_version: 62,
            preferred_protocol_version: 63,
            min_preferred_peers: 3,
            max_avg_latency_ms: 10_000,
            ban_duration_secs: 60,
            max_disconnects: 5,
            max_invalid_responses: 3,
            connect_timeout_secs: 10,
            sweep_interval_ms: 3_000,
        }
    }
}

impl PeerPoolConfig {
    pub fn ban_duration(&self) -> Duration {
        Duration::from_secs(self.ban_duration_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}
