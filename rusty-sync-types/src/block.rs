use serde::{Deserialize, Serialize};

use crate::{hash_encoded, BlockNumber, Hash, U256};

/// Represents a block header as exchanged during synchronization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    /// Hash of the parent block header.
    pub parent_hash: Hash,
    /// Digest of the ommer list carried in the body.
    pub ommers_hash: Hash,
    /// Address credited with the block reward.
    pub beneficiary: [u8; 20],
    /// Root of the state trie after executing this block.
    pub state_root: Hash,
    /// Digest of the transaction list carried in the body.
    pub transactions_root: Hash,
    /// Digest of the receipt list produced by this block.
    pub receipts_root: Hash,
    /// Proof-of-work difficulty of this block.
    pub difficulty: U256,
    /// Height of this block; genesis is zero.
    pub number: BlockNumber,
    pub gas_limit: u64,
    pub gas_used: u64,
    /// Seconds since the Unix epoch.
    pub timestamp: u64,
    pub extra_data: Vec<u8>,
    pub nonce: u64,
}

impl BlockHeader {
    /// Calculate the hash of this header.
    pub fn hash(&self) -> Hash {
        hash_encoded(self)
    }

    /// Compute the hash once and carry it along with the header.
    pub fn seal(self) -> SealedHeader {
        SealedHeader::new(self)
    }

    pub fn is_genesis(&self) -> bool {
        self.number == 0
    }
}

/// A header paired with its precomputed hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedHeader {
    header: BlockHeader,
    hash: Hash,
}

impl SealedHeader {
    pub fn new(header: BlockHeader) -> Self {
        let hash = header.hash();
        Self { header, hash }
    }

    pub fn hash(&self) -> Hash {
        self.hash
    }

    pub fn number(&self) -> BlockNumber {
        self.header.number
    }

    pub fn parent_hash(&self) -> Hash {
        self.header.parent_hash
    }

    pub fn header(&self) -> &BlockHeader {
        &self.header
    }

    pub fn into_header(self) -> BlockHeader {
        self.header
    }
}

/// Transactions and ommers of a block; the transaction payloads stay opaque.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockBody {
    pub transactions: Vec<Vec<u8>>,
    pub ommers: Vec<BlockHeader>,
}

impl BlockBody {
    pub fn transactions_root(&self) -> Hash {
        hash_encoded(&self.transactions)
    }

    pub fn ommers_hash(&self) -> Hash {
        hash_encoded(&self.ommers)
    }

    /// Whether this body is the one committed to by `header`.
    pub fn matches(&self, header: &BlockHeader) -> bool {
        self.transactions_root() == header.transactions_root && self.ommers_hash() == header.ommers_hash
    }
}

/// A full block: header plus body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub body: BlockBody,
}

impl Block {
    pub fn new(header: BlockHeader, body: BlockBody) -> Self {
        Self { header, body }
    }

    pub fn hash(&self) -> Hash {
        self.header.hash()
    }

    pub fn number(&self) -> BlockNumber {
        self.header.number
    }

    pub fn parent_hash(&self) -> Hash {
        self.header.parent_hash
    }
}

/// Opaque execution receipt of a single transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt(pub Vec<u8>);

/// Digest of a block's receipt list, compared against `receipts_root`.
pub fn receipts_root(receipts: &[Receipt]) -> Hash {
    hash_encoded(&receipts)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(number: u64) -> BlockHeader {
        BlockHeader {
            parent_hash: [0; 32],
            ommers_hash: BlockBody::default().ommers_hash(),
            beneficiary: [0; 20],
            state_root: [0; 32],
            transactions_root: BlockBody::default().transactions_root(),
            receipts_root: receipts_root(&[]),
            difficulty: U256::from(1000),
            number,
            gas_limit: 8_000_000,
            gas_used: 0,
            timestamp: 1_600_000_000 + number,
            extra_data: vec![],
            nonce: 0,
        }
    }

    #[test]
    fn test_hash_depends_on_contents() {
        assert_ne!(header(1).hash(), header(2).hash());
        assert_eq!(header(1).hash(), header(1).hash());
    }

    #[test]
    fn test_sealed_header_caches_hash() {
        let sealed = header(5).seal();
        assert_eq!(sealed.hash(), header(5).hash());
        assert_eq!(sealed.number(), 5);
    }

    #[test]
    fn test_body_matches_header() {
        let mut h = header(3);
        let body = BlockBody { transactions: vec![vec![1, 2, 3]], ommers: vec![] };
        assert!(!body.matches(&h));
        h.transactions_root = body.transactions_root();
        assert!(body.matches(&h));
    }
}
