//! Bookkeeping for wanted trie nodes.
//!
//! A hash lives in at most one of the work queue and the pending map, and is
//! recorded in the known set from the moment it is first enqueued until the
//! run ends, so a node is never fetched twice.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use rusty_sync_types::{Hash, PeerId};
use tokio::time::Instant;

use super::trie_node::NodeKind;

/// A wanted trie node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrieNodeRequest {
    pub kind: NodeKind,
    pub hash: Hash,
    pub response: Option<Vec<u8>>,
    /// When the outstanding request was sent
    pub request_time: Option<Instant>,
    /// Id of the batch this node was last sent in
    pub request_id: u64,
    /// Times this node was put back for another attempt
    pub retries: u32,
    pub peer: Option<PeerId>,
}

impl TrieNodeRequest {
    pub fn new(kind: NodeKind, hash: Hash) -> Self {
        Self { kind, hash, response: None, request_time: None, request_id: 0, retries: 0, peer: None }
    }
}

/// A pending request that outlived the timeout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiredRequest {
    pub hash: Hash,
    pub peer: Option<PeerId>,
    pub retries: u32,
}

#[derive(Debug)]
pub struct NodeRequestQueue {
    queue: VecDeque<TrieNodeRequest>,
    pending: HashMap<Hash, TrieNodeRequest>,
    known: HashSet<Hash>,
    /// Queue length up to which new children are appended
    best_size: usize,
    next_request_id: u64,
}

impl NodeRequestQueue {
    pub fn new(best_size: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            pending: HashMap::new(),
            known: HashSet::new(),
            best_size,
            next_request_id: 1,
        }
    }

    /// Enqueue a node unless it was seen before in this run.
    ///
    /// While the queue is short, children go to the back so the crawl fans out
    /// and many requests can run at once; past `best_size` they go to the front
    /// so subtrees finish before new ones open.
    pub fn enqueue(&mut self, kind: NodeKind, hash: Hash) -> bool {
        if !self.known.insert(hash) {
            return false;
        }
        let request = TrieNodeRequest::new(kind, hash);
        if self.queue.len() < self.best_size {
            self.queue.push_back(request);
        } else {
            self.queue.push_front(request);
        }
        true
    }

    /// Move up to `max` queued nodes to pending under a fresh request id.
    pub fn take_batch(&mut self, max: usize, peer: PeerId, now: Instant) -> Option<(u64, Vec<Hash>)> {
        if self.queue.is_empty() || max == 0 {
            return None;
        }
        let request_id = self.next_request_id;
        self.next_request_id += 1;

        let count = max.min(self.queue.len());
        let mut hashes = Vec::with_capacity(count);
        for mut request in self.queue.drain(..count) {
            request.request_time = Some(now);
            request.request_id = request_id;
            request.peer = Some(peer);
            hashes.push(request.hash);
            self.pending.insert(request.hash, request);
        }
        Some((request_id, hashes))
    }

    /// Claim the pending entry for `hash` if it belongs to `request_id`.
    pub fn accept(&mut self, hash: &Hash, request_id: u64) -> Option<TrieNodeRequest> {
        match self.pending.get(hash) {
            Some(request) if request.request_id == request_id => self.pending.remove(hash),
            _ => None,
        }
    }

    /// Put a node back at the front of the queue for another attempt.
    pub fn requeue_front(&mut self, mut request: TrieNodeRequest) {
        request.retries += 1;
        request.request_time = None;
        request.peer = None;
        self.queue.push_front(request);
    }

    /// Requeue every node of batch `request_id` that is still pending.
    pub fn fail_batch(&mut self, request_id: u64, hashes: &[Hash]) -> usize {
        let mut failed = 0;
        for hash in hashes.iter().rev() {
            if let Some(request) = self.accept(hash, request_id) {
                self.requeue_front(request);
                failed += 1;
            }
        }
        failed
    }

    /// Requeue pending nodes sent more than `timeout` ago.
    pub fn expire(&mut self, now: Instant, timeout: Duration) -> Vec<ExpiredRequest> {
        let stale: Vec<Hash> = self
            .pending
            .values()
            .filter(|r| r.request_time.map_or(true, |sent| now.saturating_duration_since(sent) >= timeout))
            .map(|r| r.hash)
            .collect();

        let mut expired = Vec::with_capacity(stale.len());
        for hash in stale {
            if let Some(request) = self.pending.remove(&hash) {
                expired.push(ExpiredRequest { hash, peer: request.peer, retries: request.retries + 1 });
                self.requeue_front(request);
            }
        }
        expired
    }

    pub fn is_done(&self) -> bool {
        self.queue.is_empty() && self.pending.is_empty()
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn known(&self) -> usize {
        self.known.len()
    }

    pub fn is_known(&self, hash: &Hash) -> bool {
        self.known.contains(hash)
    }

    pub fn is_pending(&self, hash: &Hash) -> bool {
        self.pending.contains_key(hash)
    }

    pub fn is_queued(&self, hash: &Hash) -> bool {
        self.queue.iter().any(|r| r.hash == *hash)
    }
}
