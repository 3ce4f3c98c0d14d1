use serde::{Deserialize, Serialize};

use crate::{empty_data_hash, empty_trie_hash, Hash, U256};

/// Account record stored as the value of a state trie leaf.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRecord {
    pub nonce: u64,
    pub balance: U256,
    /// Root of this account's storage trie.
    pub storage_root: Hash,
    /// Hash of this account's contract code.
    pub code_hash: Hash,
}

impl AccountRecord {
    /// An account with no code and no storage.
    pub fn plain(nonce: u64, balance: U256) -> Self {
        Self { nonce, balance, storage_root: empty_trie_hash(), code_hash: empty_data_hash() }
    }

    pub fn has_code(&self) -> bool {
        self.code_hash != empty_data_hash()
    }

    pub fn has_storage(&self) -> bool {
        self.storage_root != empty_trie_hash()
    }

    pub fn encode(&self) -> Vec<u8> {
        bincode::serialize(self).unwrap_or_default()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_account_has_no_children() {
        let account = AccountRecord::plain(1, U256::from(10));
        assert!(!account.has_code());
        assert!(!account.has_storage());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(AccountRecord::decode(&[1, 2]).is_err());
    }
}
