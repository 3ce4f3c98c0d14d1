//! Rusty Sync engine
//!
//! Pulls headers, bodies and state from untrusted peers and turns them into a
//! single importable chain. The [`queue`] types reconcile what peers send, the
//! [`downloader`] schedules requests around a queue, [`state`] bootstraps the
//! state trie of a pivot block, and [`network::sync_manager`] coordinates it all.

#![warn(unused_crate_dependencies)]

/// Collaborator traits: chain store, state store, listener
pub mod chain;
/// Configuration loaded from TOML
pub mod config;
/// Header and body scheduling loops
pub mod downloader;
/// Error types
pub mod error;
/// Peer transport and the sync coordinator
pub mod network;
/// Header DAG, forward and reverse queues
pub mod queue;
/// Fast sync state retrieval
pub mod state;
/// Structural header and body checks
pub mod validation;

pub use chain::{ChainStore, ImportResult, StateStore, SyncListener};
pub use config::{
    DownloaderConfig, FastSyncConfig, QueueConfig, SyncConfig, SyncManagerConfig, ValidationConfig,
};
pub use downloader::{BlockDownloader, DownloaderStats};
pub use error::{SyncError, SyncResult, TransportError, ValidationError};
pub use network::sync_manager::{
    transition, SyncAction, SyncContext, SyncEvent, SyncManager, SyncMode, SyncSnapshot, SyncStatus,
};
pub use network::{with_read_timeout, SyncNetwork};
pub use queue::{DagSyncQueue, ForwardSyncQueue, ReverseSyncQueue, SyncQueue};
pub use state::{BincodeTrieDecoder, FastSyncManager, FastSyncPhase, FastSyncStats, NodeKind, TrieNode, TrieNodeDecoder};
pub use validation::{BasicHeaderValidator, HeaderValidator};
