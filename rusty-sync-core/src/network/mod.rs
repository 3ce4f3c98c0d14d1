use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use rusty_sync_types::{
    BlockBodies, BlockHeaders, BlockReceipts, GetBodies, GetHeaders, GetReceipts, GetTrieNodes, PeerId, TrieNodes,
};

use crate::error::TransportError;

pub mod sync_manager;

/// Request/response transport to remote peers
///
/// Framing, handshakes and connection management belong to the implementor;
/// the engine only relies on each call eventually resolving.
#[async_trait]
pub trait SyncNetwork: Send + Sync {
    /// Request a header range from a peer
    async fn get_headers(&self, peer: PeerId, request: GetHeaders) -> Result<BlockHeaders, TransportError>;

    /// Request bodies by header hash
    async fn get_bodies(&self, peer: PeerId, request: GetBodies) -> Result<BlockBodies, TransportError>;

    /// Request raw trie nodes by hash
    async fn get_trie_nodes(&self, peer: PeerId, request: GetTrieNodes) -> Result<TrieNodes, TransportError>;

    /// Request receipts by block hash
    async fn get_receipts(&self, peer: PeerId, request: GetReceipts) -> Result<BlockReceipts, TransportError>;

    /// Ask the transport to close the connection to a peer
    fn disconnect(&self, _peer: PeerId) {}
}

/// Bound a request by the read timeout.
pub async fn with_read_timeout<T, F>(timeout: Duration, request: F) -> Result<T, TransportError>
where
    F: Future<Output = Result<T, TransportError>>,
{
    tokio::time::timeout(timeout, request).await.map_err(|_| TransportError::Timeout)?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_read_timeout_maps_to_transport_timeout() {
        let slow = async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok::<_, TransportError>(1)
        };
        assert_eq!(with_read_timeout(Duration::from_secs(10), slow).await, Err(TransportError::Timeout));

        let fast = async { Ok::<_, TransportError>(2) };
        assert_eq!(with_read_timeout(Duration::from_secs(10), fast).await, Ok(2));
    }
}
