//! Collaborators the engine consumes: the block chain, the state store and an
//! outward listener.

use rusty_sync_types::{Block, BlockNumber, Hash, Receipt, SealedHeader, U256};

use crate::error::SyncResult;
use crate::network::sync_manager::SyncMode;

/// Outcome of handing a block to the importer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportResult {
    /// Imported and now the best block
    ImportedBest,
    /// Imported on a side chain
    ImportedNotBest,
    /// Already known
    Exists,
    /// Parent unknown; the block is an orphan
    NoParent,
    /// Rejected by block validation
    Invalid,
}

impl ImportResult {
    pub fn is_success(&self) -> bool {
        matches!(self, ImportResult::ImportedBest | ImportResult::ImportedNotBest | ImportResult::Exists)
    }
}

/// Block storage and import, owned by the node
pub trait ChainStore: Send + Sync {
    /// Header of the current best block
    fn best_header(&self) -> SealedHeader;

    /// Cumulative difficulty of the best chain
    fn total_difficulty(&self) -> U256;

    fn block_by_number(&self, number: BlockNumber) -> Option<Block>;

    fn block_by_hash(&self, hash: &Hash) -> Option<Block>;

    /// Validate, execute and connect a block
    fn import_block(&self, block: &Block) -> ImportResult;

    /// Store a block without executing it
    fn persist_block(&self, block: &Block, total_difficulty: U256) -> SyncResult<()>;

    fn persist_receipts(&self, block_hash: Hash, receipts: Vec<Receipt>) -> SyncResult<()>;

    /// Make `block` the chain head
    fn set_best_block(&self, block: &Block, total_difficulty: U256) -> SyncResult<()>;

    fn best_number(&self) -> BlockNumber {
        self.best_header().number()
    }
}

/// Raw trie node storage
pub trait StateStore: Send + Sync {
    fn contains(&self, hash: &Hash) -> bool;

    fn put_batch(&self, nodes: Vec<(Hash, Vec<u8>)>) -> SyncResult<()>;

    fn flush(&self) -> SyncResult<()>;
}

/// Receives sync progress notifications
pub trait SyncListener: Send + Sync {
    /// Called when `mode` has caught up with the network
    fn on_sync_done(&self, mode: SyncMode);
}
