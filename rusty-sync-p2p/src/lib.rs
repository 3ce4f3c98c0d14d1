//! Rusty Sync peer pool
//!
//! Tracks the peers usable for chain synchronization, hands out idle peers to
//! the download loops, selects the best-chain peer and enforces timed bans.

#![warn(unused_crate_dependencies)]

/// Pool configuration
pub mod config;
/// Peer pool errors
pub mod error;
/// Peer records, roles and statistics
pub mod peer;
/// Best-peer and sync-subset selection
pub mod peer_selection;
/// The pool itself
pub mod pool;
/// Periodic health sweep task
pub mod sweep;

pub use config::PeerPoolConfig;
pub use error::{PeerPoolError, PeerPoolResult};
pub use peer::{Peer, PeerInfo, PeerStats, SyncRole};
pub use peer_selection::{in_weight_range, SelectionPolicy};
pub use pool::{PeerPenalty, PeerPool, PoolListener, SweepReport};
pub use sweep::spawn_sweep;
