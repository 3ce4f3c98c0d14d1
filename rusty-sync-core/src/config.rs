//! Configuration for the synchronization engine.
//!
//! Every section has defaults, so a TOML file only needs the keys it changes:
//!
//! ```toml
//! [peer_pool]
//! ban_duration_secs = 120
//!
//! [fast_sync]
//! enabled = true
//! ```

use std::fs;
use std::path::Path;
use std::time::Duration;

use rusty_sync_p2p::PeerPoolConfig;
use serde::{Deserialize, Serialize};

use crate::error::SyncResult;

/// Header DAG queue settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Length of the longest chain kept above the committed boundary
    pub retention_window: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { retention_window: 192 }
    }
}

/// Structural header checks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    /// How far a header timestamp may run ahead of the local clock (in seconds)
    pub max_future_secs: u64,
    pub max_extra_data: usize,
    pub min_difficulty: u64,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self { max_future_secs: 15, max_extra_data: 32, min_difficulty: 1 }
    }
}

/// Header and body scheduling loops
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloaderConfig {
    pub max_headers_per_request: u32,
    /// Header requests issued per loop iteration
    pub max_header_requests: usize,
    /// Header loop pauses while this many headers wait for bodies
    pub header_queue_limit: usize,
    /// Body loop pauses while this many bodies wait for export
    pub body_queue_limit: usize,
    pub max_bodies_per_request: usize,
    /// Body sets this small are asked from the peers that sent their headers
    pub small_body_set: usize,
    /// Header latch timeout once sync is complete (in milliseconds)
    pub header_wait_synced_ms: u64,
    /// Header latch timeout while catching up (in milliseconds)
    pub header_wait_catchup_ms: u64,
    /// Upper bound on a body latch wait (in milliseconds)
    pub body_wait_ms: u64,
    /// Peers silent for this long are dropped (in milliseconds)
    pub read_timeout_ms: u64,
    pub export_channel_capacity: usize,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            max_headers_per_request: 192,
            max_header_requests: 4,
            header_queue_limit: 20_000,
            body_queue_limit: 2_000,
            max_bodies_per_request: 100,
            small_body_set: 3,
            header_wait_synced_ms: 500,
            header_wait_catchup_ms: 2_000,
            body_wait_ms: 12_000,
            read_timeout_ms: 10_000,
            export_channel_capacity: 64,
        }
    }
}

impl DownloaderConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn header_wait(&self, sync_done: bool) -> Duration {
        Duration::from_millis(if sync_done { self.header_wait_synced_ms } else { self.header_wait_catchup_ms })
    }

    pub fn body_wait(&self) -> Duration {
        Duration::from_millis(self.body_wait_ms)
    }
}

/// Trie node retrieval and the steps around it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FastSyncConfig {
    pub enabled: bool,
    /// Outstanding node requests older than this are re-queued (in milliseconds)
    pub trie_request_timeout_ms: u64,
    pub nodes_per_request: usize,
    /// Below this queue length children are appended; above it they are pushed to the front
    pub queue_best_size: usize,
    /// Buffered node writes flushed to the state store in batches of this size
    pub write_batch_size: usize,
    /// Retries past this count are logged; there is no retry cap
    pub retry_warn_threshold: u32,
    /// Retrieval loop cadence (in milliseconds)
    pub loop_interval_ms: u64,
    pub progress_log_secs: u64,
    /// Distance of the pivot block below the best peer's head
    pub pivot_distance: u64,
    /// Peers wanted before a pivot is chosen
    pub min_peers_for_pivot: usize,
    /// Peers asked for the pivot header
    pub pivot_peers: usize,
    /// Choose a pivot with fewer peers after this long (in seconds)
    pub pivot_force_secs: u64,
    /// Blocks fetched below the pivot after the state download
    pub ancestor_window: u64,
    pub receipts_per_request: usize,
    /// Bounded join wait in `close()` (in milliseconds)
    pub close_timeout_ms: u64,
}

impl Default for FastSyncConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            trie_request_timeout_ms: 3_000,
            nodes_per_request: 384,
            queue_best_size: 100_000,
            write_batch_size: 1_024,
            retry_warn_threshold: 10,
            loop_interval_ms: 100,
            progress_log_secs: 10,
            pivot_distance: 192,
            min_peers_for_pivot: 5,
            pivot_peers: 3,
            pivot_force_secs: 60,
            ancestor_window: 192,
            receipts_per_request: 100,
            close_timeout_ms: 5_000,
        }
    }
}

impl FastSyncConfig {
    pub fn trie_request_timeout(&self) -> Duration {
        Duration::from_millis(self.trie_request_timeout_ms)
    }

    pub fn loop_interval(&self) -> Duration {
        Duration::from_millis(self.loop_interval_ms)
    }

    pub fn progress_log_interval(&self) -> Duration {
        Duration::from_secs(self.progress_log_secs)
    }

    pub fn pivot_force(&self) -> Duration {
        Duration::from_secs(self.pivot_force_secs)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }
}

/// Mode switching and gap recovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncManagerConfig {
    /// Long sync ends once the node is at most this many blocks behind
    pub forward_switch_threshold: u64,
    /// Short sync falls back to long sync beyond this many blocks behind
    pub backward_switch_threshold: u64,
    pub gap_recovery_max_headers: u32,
    pub gap_recovery_timeout_ms: u64,
    pub status_log_secs: u64,
}

impl Default for SyncManagerConfig {
    fn default() -> Self {
        Self {
            forward_switch_threshold: 5,
            backward_switch_threshold: 100,
            gap_recovery_max_headers: 192,
            gap_recovery_timeout_ms: 10_000,
            status_log_secs: 30,
        }
    }
}

impl SyncManagerConfig {
    pub fn gap_recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.gap_recovery_timeout_ms)
    }
}

/// Configuration for the whole engine
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub peer_pool: PeerPoolConfig,
    pub queue: QueueConfig,
    pub validation: ValidationConfig,
    pub downloader: DownloaderConfig,
    pub fast_sync: FastSyncConfig,
    pub manager: SyncManagerConfig,
}

impl SyncConfig {
    pub fn from_toml_str(text: &str) -> SyncResult<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> SyncResult<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }
}
