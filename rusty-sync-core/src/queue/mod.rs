//! Header and block queues feeding the block downloader.
//!
//! A queue decides which headers and bodies to request next, accepts what
//! peers send back, and releases complete blocks in the order they can be
//! imported.

use rusty_sync_types::{Block, GetHeaders, Hash, HeaderStart, PeerId, SealedHeader};

pub mod dag;
pub mod forward;
pub mod reverse;

pub use dag::DagSyncQueue;
pub use forward::ForwardSyncQueue;
pub use reverse::ReverseSyncQueue;

/// A header together with the peer that supplied it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderWithPeer {
    pub header: SealedHeader,
    pub peer: PeerId,
}

impl HeaderWithPeer {
    pub fn new(header: SealedHeader, peer: PeerId) -> Self {
        Self { header, peer }
    }

    pub fn hash(&self) -> Hash {
        self.header.hash()
    }

    pub fn number(&self) -> u64 {
        self.header.number()
    }
}

/// A block together with the peer that supplied its header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockWithPeer {
    pub block: Block,
    /// `None` for blocks that did not come from the network
    pub peer: Option<PeerId>,
}

/// A range of headers wanted from some peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadersRequest {
    pub start: HeaderStart,
    pub count: u32,
    pub reverse: bool,
}

impl HeadersRequest {
    pub fn by_number(start: u64, count: u32, reverse: bool) -> Self {
        Self { start: HeaderStart::Number(start), count, reverse }
    }

    pub fn by_hash(start: Hash, count: u32, reverse: bool) -> Self {
        Self { start: HeaderStart::Hash(start), count, reverse }
    }

    pub fn to_message(&self) -> GetHeaders {
        GetHeaders { start: self.start, max_headers: self.count, skip: 0, reverse: self.reverse }
    }
}

/// Headers whose bodies are wanted
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlocksRequest {
    pub headers: Vec<HeaderWithPeer>,
}

impl BlocksRequest {
    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.headers.len()
    }

    pub fn hashes(&self) -> Vec<Hash> {
        self.headers.iter().map(HeaderWithPeer::hash).collect()
    }

    /// Split into requests of at most `max` headers each.
    pub fn split(self, max: usize) -> Vec<BlocksRequest> {
        self.headers.chunks(max.max(1)).map(|chunk| BlocksRequest { headers: chunk.to_vec() }).collect()
    }
}

/// Result of checking a header batch against what the queue expects
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidatedHeaders {
    /// The longest acceptable prefix of the batch
    pub headers: Vec<HeaderWithPeer>,
    /// Set when the batch contained data that must be reported
    pub invalid_peer: Option<PeerId>,
    pub reason: Option<String>,
}

impl ValidatedHeaders {
    pub fn valid(headers: Vec<HeaderWithPeer>) -> Self {
        Self { headers, invalid_peer: None, reason: None }
    }

    pub fn is_valid(&self) -> bool {
        self.invalid_peer.is_none()
    }
}

/// Common interface of the DAG, forward and reverse queues
pub trait SyncQueue: Send + 'static {
    /// Header ranges to request next; `None` once no more headers are needed.
    fn request_headers(&mut self, max_size: u32, max_requests: usize, max_total: usize)
        -> Option<Vec<HeadersRequest>>;

    /// Check a received batch before it is added.
    fn validate_headers(&self, headers: Vec<HeaderWithPeer>) -> ValidatedHeaders {
        ValidatedHeaders::valid(headers)
    }

    /// Insert headers and return the ones that were new.
    fn add_headers(&mut self, headers: Vec<HeaderWithPeer>) -> Vec<HeaderWithPeer>;

    /// Up to `max` headers whose bodies are still missing.
    fn request_blocks(&mut self, max: usize) -> BlocksRequest;

    /// Attach bodies and return the blocks that became exportable, in export order.
    fn add_blocks(&mut self, blocks: Vec<Block>) -> Vec<BlockWithPeer>;

    /// Headers held that are not exported yet
    fn header_count(&self) -> usize;

    /// Bodies held that are not exported yet
    fn body_count(&self) -> usize;

    /// Whether every wanted block has been exported
    fn is_complete(&self) -> bool {
        false
    }
}
