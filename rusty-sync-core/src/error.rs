//! Error types for the synchronization engine.

use std::io;

use rusty_sync_p2p::PeerPoolError;
use rusty_sync_types::{BlockNumber, Hash, PeerId};
use thiserror::Error;

fn format_hash(hash: &Hash) -> String {
    hex::encode(&hash[..8])
}

/// Failures of a single request to a peer
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Peer did not answer within the read timeout
    #[error("Request timed out")]
    Timeout,

    #[error("Peer {0} disconnected")]
    Disconnected(PeerId),

    /// Peer answered with nothing usable
    #[error("Empty response")]
    EmptyResponse,

    #[error("Protocol mismatch: {0}")]
    ProtocolMismatch(String),

    #[error("Transport error: {0}")]
    Other(String),
}

/// Structural problems found in headers or bodies received from a peer
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Header {number} timestamp {timestamp} is beyond the allowed limit {limit}")]
    TimestampInFuture { number: BlockNumber, timestamp: u64, limit: u64 },

    #[error("Header {number} timestamp {timestamp} is not after its parent's {parent}")]
    TimestampNotIncreasing { number: BlockNumber, timestamp: u64, parent: u64 },

    #[error("Header {number} difficulty is out of bounds")]
    DifficultyOutOfBounds { number: BlockNumber },

    #[error("Header {number} extra data is {len} bytes (max: {max} bytes)")]
    ExtraDataTooLong { number: BlockNumber, len: usize, max: usize },

    #[error("Header {number} gas used {used} exceeds gas limit {limit}")]
    GasUsedExceedsLimit { number: BlockNumber, used: u64, limit: u64 },

    #[error("Body does not match header {number}")]
    BodyMismatch { number: BlockNumber },

    #[error("Receipts do not match block {}", format_hash(.0))]
    ReceiptsMismatch(Hash),

    #[error("Chain break: expected {}, got {}", format_hash(.expected), format_hash(.found))]
    ChainBreak { expected: Hash, found: Hash },

    #[error("Trie node bytes do not hash to {}", format_hash(.0))]
    NodeHashMismatch(Hash),
}

/// Main error type for the synchronization engine
#[derive(Error, Debug)]
pub enum SyncError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    PeerPool(#[from] PeerPoolError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("Chain store error: {0}")]
    Store(String),

    #[error("Trie node decode error: {0}")]
    Decode(String),

    #[error("No pivot block could be agreed on: {0}")]
    NoPivot(String),

    #[error("Sync component stopped")]
    Stopped,
}

/// A specialized `Result` type for synchronization operations
pub type SyncResult<T> = std::result::Result<T, SyncError>;
