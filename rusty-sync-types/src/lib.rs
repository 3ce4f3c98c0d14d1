//! Data model shared by the peer pool and the synchronization engine.
//!
//! Headers, bodies and trie nodes are identified by 32-byte blake3 digests of
//! their canonical bincode encoding. Wire framing is not defined here; the
//! message structs in [`p2p`] only describe the request/response contract.

use serde::{Deserialize, Serialize};
use std::fmt;

pub mod account;
pub mod block;
pub mod p2p;

pub use account::AccountRecord;
pub use block::{receipts_root, Block, BlockBody, BlockHeader, Receipt, SealedHeader};
pub use p2p::{
    BlockBodies, BlockHeaders, BlockReceipts, GetBodies, GetHeaders, GetReceipts, GetTrieNodes, HeaderStart,
    TrieNodes,
};

pub use primitive_types::U256;

pub type Hash = [u8; 32];

/// Block height.
pub type BlockNumber = u64;

/// Digest of an empty byte string; the code hash of accounts without code.
pub fn empty_data_hash() -> Hash {
    blake3::hash(&[]).into()
}

/// Root of a trie with no entries.
pub fn empty_trie_hash() -> Hash {
    blake3::hash(&[0u8]).into()
}

/// Digest of an arbitrary byte slice.
pub fn hash_bytes(bytes: &[u8]) -> Hash {
    blake3::hash(bytes).into()
}

/// Digest of a serializable value's bincode encoding.
pub fn hash_encoded<T: Serialize>(value: &T) -> Hash {
    let serialized = bincode::serialize(value).unwrap_or_default();
    blake3::hash(&serialized).into()
}

/// First four bytes of a hash in hex, for log lines.
pub fn short_hex(hash: &Hash) -> String {
    hex::encode(&hash[..4])
}

/// Identity of a remote node as established by the handshake.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId(pub [u8; 32]);

impl PeerId {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        PeerId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl From<[u8; 32]> for PeerId {
    fn from(bytes: [u8; 32]) -> Self {
        PeerId(bytes)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self)
    }
}
