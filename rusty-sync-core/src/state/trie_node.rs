//! Trie node encoding and child discovery for fast sync.

use rusty_sync_types::{hash_bytes, AccountRecord, Hash};
use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};

/// Which trie a node belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    /// Account trie; leaf values are account records
    State,
    /// Per-account storage trie
    Storage,
    /// Contract bytecode blob
    Code,
}

/// Node in a Merkle Patricia Trie
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrieNode {
    Empty,
    /// Leaf node containing the rest of the key and the value
    Leaf { key_end: Vec<u8>, value: Vec<u8> },
    /// Extension node with a shared key prefix
    Extension { common_prefix: Vec<u8>, next_hash: Hash },
    /// Branch node with up to 16 children (for hex digits 0-F)
    Branch { children: [Option<Hash>; 16], value: Option<Vec<u8>> },
}

impl TrieNode {
    pub fn encode(&self) -> Vec<u8> {
        bincode::serialize(self).unwrap_or_default()
    }

    pub fn decode(bytes: &[u8]) -> SyncResult<Self> {
        bincode::deserialize(bytes).map_err(|e| SyncError::Decode(e.to_string()))
    }

    /// Hash of the encoded node, the key peers serve it under
    pub fn hash(&self) -> Hash {
        hash_bytes(&self.encode())
    }

    pub fn child_hashes(&self) -> Vec<Hash> {
        match self {
            TrieNode::Empty | TrieNode::Leaf { .. } => Vec::new(),
            TrieNode::Extension { next_hash, .. } => vec![*next_hash],
            TrieNode::Branch { children, .. } => children.iter().flatten().copied().collect(),
        }
    }

    pub fn value(&self) -> Option<&[u8]> {
        match self {
            TrieNode::Leaf { value, .. } => Some(value),
            TrieNode::Branch { value: Some(value), .. } => Some(value),
            _ => None,
        }
    }
}

/// Extracts the nodes referenced by a fetched node
pub trait TrieNodeDecoder: Send + Sync {
    fn children(&self, kind: NodeKind, bytes: &[u8]) -> SyncResult<Vec<(NodeKind, Hash)>>;
}

/// Decoder for [`TrieNode`] bincode encoding
#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeTrieDecoder;

impl TrieNodeDecoder for BincodeTrieDecoder {
    fn children(&self, kind: NodeKind, bytes: &[u8]) -> SyncResult<Vec<(NodeKind, Hash)>> {
        if kind == NodeKind::Code {
            return Ok(Vec::new());
        }

        let node = TrieNode::decode(bytes)?;
        let mut children: Vec<(NodeKind, Hash)> = node.child_hashes().into_iter().map(|h| (kind, h)).collect();

        if kind == NodeKind::State {
            if let Some(value) = node.value() {
                let account = AccountRecord::decode(value).map_err(|e| SyncError::Decode(e.to_string()))?;
                if account.has_code() {
                    children.push((NodeKind::Code, account.code_hash));
                }
                if account.has_storage() {
                    children.push((NodeKind::Storage, account.storage_root));
                }
            }
        }
        Ok(children)
    }
}
