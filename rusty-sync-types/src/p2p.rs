//! Request/response contract between the synchronization engine and peers.
//!
//! Only the logical shape of each exchange is fixed here; how a message is
//! framed on the wire belongs to the protocol layer.

use serde::{Deserialize, Serialize};

use crate::{BlockBody, BlockHeader, BlockNumber, Hash, Receipt};

/// Where a header range starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HeaderStart {
    Number(BlockNumber),
    Hash(Hash),
}

/// Get headers request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetHeaders {
    pub start: HeaderStart,
    pub max_headers: u32,
    /// Number of blocks skipped between consecutive returned headers.
    pub skip: u32,
    /// Walk toward genesis instead of toward the head.
    pub reverse: bool,
}

impl GetHeaders {
    pub fn by_number(start: BlockNumber, max_headers: u32, reverse: bool) -> Self {
        Self { start: HeaderStart::Number(start), max_headers, skip: 0, reverse }
    }

    pub fn by_hash(start: Hash, max_headers: u32, reverse: bool) -> Self {
        Self { start: HeaderStart::Hash(start), max_headers, skip: 0, reverse }
    }
}

/// Headers response
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeaders {
    pub headers: Vec<BlockHeader>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetBodies {
    pub hashes: Vec<Hash>,
}

/// Bodies come back in request order; missing trailing entries are allowed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockBodies {
    pub bodies: Vec<BlockBody>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetTrieNodes {
    pub hashes: Vec<Hash>,
}

/// Trie nodes response: pairs of requested hash and raw node bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrieNodes {
    pub nodes: Vec<(Hash, Vec<u8>)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetReceipts {
    pub block_hashes: Vec<Hash>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockReceipts {
    pub receipts: Vec<Vec<Receipt>>,
}
