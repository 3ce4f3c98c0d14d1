//! Error types for the peer pool.

use rusty_sync_types::{PeerId, U256};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PeerPoolError {
    /// Peer is serving a ban
    #[error("Peer {0} is banned")]
    Banned(PeerId),

    /// Peer is already registered
    #[error("Peer {0} is already in the pool")]
    AlreadyConnected(PeerId),

    /// Peer's chain is too far behind the best known peer
    #[error("Peer {peer} weight {weight} is below the accepted range of best weight {best}")]
    WeightTooLow { peer: PeerId, weight: U256, best: U256 },

    /// Peer speaks a protocol version we do not support
    #[error("Peer {peer} protocol version {version} is below minimum {min}")]
    ProtocolTooOld { peer: PeerId, version: u8, min: u8 },

    /// Peer is not registered
    #[error("Unknown peer {0}")]
    UnknownPeer(PeerId),
}

/// A specialized `Result` type for peer pool operations
pub type PeerPoolResult<T> = std::result::Result<T, PeerPoolError>;
