//! State retrieval for fast sync.

pub mod fast_sync;
pub mod node_request;
pub mod pivot;
pub mod receipts;
pub mod trie_node;

pub use fast_sync::{FastSyncManager, FastSyncPhase, FastSyncStats};
pub use node_request::{NodeRequestQueue, TrieNodeRequest};
pub use pivot::{Pivot, PivotSelector};
pub use receipts::ReceiptsDownloader;
pub use trie_node::{BincodeTrieDecoder, NodeKind, TrieNode, TrieNodeDecoder};
