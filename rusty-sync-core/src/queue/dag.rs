//! Header DAG queue for live and catch-up sync.
//!
//! Headers arrive from many peers in any order and may disagree. They are kept
//! in generations (one map per block number) so competing headers at the same
//! height can coexist. The longest chain starting at the committed root is
//! recomputed after every insertion, and bodies are exported only along that
//! chain, so blocks leave the queue strictly in number order.

use std::collections::BTreeMap;

use rusty_sync_types::{short_hex, Block, BlockBody, BlockNumber, Hash, PeerId, SealedHeader};
use tracing::{debug, trace};

use super::{BlockWithPeer, BlocksRequest, HeaderWithPeer, HeadersRequest, SyncQueue};
use crate::config::QueueConfig;

#[derive(Debug, Clone)]
struct HeaderRecord {
    header: SealedHeader,
    /// `None` only for the local root
    peer: Option<PeerId>,
    body: Option<BlockBody>,
    exported: bool,
}

type Generation = BTreeMap<Hash, HeaderRecord>;

/// Multi-branch header queue exporting along the longest chain
#[derive(Debug)]
pub struct DagSyncQueue {
    window: u64,
    headers: BTreeMap<BlockNumber, Generation>,
    /// Generations at or below this number hold a single record
    dark_zone: BlockNumber,
    last_exported: BlockNumber,
    /// Highest generation holding any header
    max_num: BlockNumber,
    /// Longest chain; index 0 is the record at `dark_zone`
    longest: Vec<Hash>,
}

impl DagSyncQueue {
    /// Start from the local best header, which counts as already exported.
    pub fn new(start: SealedHeader, config: &QueueConfig) -> Self {
        let number = start.number();
        let hash = start.hash();
        let mut root = Generation::new();
        root.insert(hash, HeaderRecord { header: start, peer: None, body: None, exported: true });
        let mut headers = BTreeMap::new();
        headers.insert(number, root);
        Self {
            window: config.retention_window.max(1),
            headers,
            dark_zone: number,
            last_exported: number,
            max_num: number,
            longest: vec![hash],
        }
    }

    /// Number of the chain tip
    pub fn frontier(&self) -> BlockNumber {
        self.dark_zone + self.longest.len().saturating_sub(1) as u64
    }

    /// Headers at or below this number are no longer accepted
    pub fn committed_number(&self) -> BlockNumber {
        self.dark_zone.max(self.last_exported)
    }

    pub fn dark_zone(&self) -> BlockNumber {
        self.dark_zone
    }

    pub fn last_exported(&self) -> BlockNumber {
        self.last_exported
    }

    /// Hashes of the selected chain, from the dark zone root to the tip
    pub fn longest_chain(&self) -> &[Hash] {
        &self.longest
    }

    pub fn contains(&self, number: BlockNumber, hash: &Hash) -> bool {
        self.headers.get(&number).map_or(false, |gen| gen.contains_key(hash))
    }

    /// Headers referencing a parent beyond the chain tip are waiting on a gap
    pub fn has_gaps(&self) -> bool {
        self.max_num > self.frontier()
    }

    fn max_accepted(&self, frontier: BlockNumber) -> BlockNumber {
        frontier.saturating_add(self.window.saturating_mul(2))
    }

    /// Breadth-first extension of candidate chains, one generation at a time.
    ///
    /// The record on the current chain leads its generation and the rest
    /// follow in hash order, so an equally long branch never displaces the
    /// selected one while a strictly longer branch always wins. Below the last
    /// exported number only exported records may extend a chain.
    fn recompute_longest(&mut self) {
        let Some(root) = self.headers.get(&self.dark_zone).and_then(|gen| gen.keys().next().copied()) else {
            self.longest.clear();
            return;
        };

        let mut tips = vec![root];
        let mut number = self.dark_zone + 1;
        while let Some(gen) = self.headers.get(&number) {
            let committed = number <= self.last_exported;
            let mut next = Vec::new();
            for tip in &tips {
                next.extend(
                    gen.iter()
                        .filter(|(_, record)| record.header.parent_hash() == *tip && (!committed || record.exported))
                        .map(|(hash, _)| *hash),
                );
            }
            if next.is_empty() {
                break;
            }
            let current = self.longest.get((number - self.dark_zone) as usize);
            if let Some(index) = current.and_then(|hash| next.iter().position(|h| h == hash)) {
                next[..=index].rotate_right(1);
            }
            tips = next;
            number += 1;
        }

        let mut chain = Vec::with_capacity((number - self.dark_zone) as usize);
        let mut cursor = tips[0];
        let mut height = number - 1;
        loop {
            chain.push(cursor);
            if height == self.dark_zone {
                break;
            }
            match self.headers.get(&height).and_then(|gen| gen.get(&cursor)) {
                Some(record) => cursor = record.header.parent_hash(),
                None => break,
            }
            height -= 1;
        }
        chain.reverse();
        self.longest = chain;
    }

    /// Advance the dark zone once the chain outgrows the window and drop
    /// exported generations below it.
    fn trim(&mut self) {
        let length = self.longest.len().saturating_sub(1) as u64;
        if length > self.window {
            let shift = length - self.window;
            for offset in 1..=shift {
                let number = self.dark_zone + offset;
                let keep = self.longest[offset as usize];
                if let Some(gen) = self.headers.get_mut(&number) {
                    gen.retain(|hash, _| *hash == keep);
                }
            }
            self.longest.drain(..shift as usize);
            self.dark_zone += shift;
            debug!(dark_zone = self.dark_zone, "Advanced committed boundary");
        }

        let limit = self.dark_zone.min(self.last_exported.saturating_add(1));
        let stale: Vec<BlockNumber> = self.headers.range(..limit).map(|(n, _)| *n).collect();
        for number in stale {
            self.headers.remove(&number);
        }
    }

    fn chain_hash_at(&self, number: BlockNumber) -> Option<Hash> {
        if number <= self.dark_zone {
            self.headers.get(&number).and_then(|gen| gen.keys().next().copied())
        } else {
            self.longest.get((number - self.dark_zone) as usize).copied()
        }
    }

    fn export(&mut self) -> Vec<BlockWithPeer> {
        let mut exported = Vec::new();
        loop {
            let number = self.last_exported + 1;
            let Some(hash) = self.chain_hash_at(number) else { break };
            let Some(gen) = self.headers.get_mut(&number) else { break };
            let Some(record) = gen.get_mut(&hash) else { break };
            let Some(body) = record.body.take() else { break };

            record.exported = true;
            exported.push(BlockWithPeer { block: Block::new(record.header.header().clone(), body), peer: record.peer });
            // competing records at an exported height can never be exported
            gen.retain(|h, _| *h == hash);
            self.last_exported = number;
        }
        if let (Some(first), Some(last)) = (exported.first(), exported.last()) {
            debug!(from = first.block.number(), to = last.block.number(), "Exported blocks");
            self.trim();
        }
        exported
    }
}

impl SyncQueue for DagSyncQueue {
    fn request_headers(
        &mut self,
        max_size: u32,
        max_requests: usize,
        max_total: usize,
    ) -> Option<Vec<HeadersRequest>> {
        let size = u64::from(max_size.max(1));
        let frontier = self.frontier();
        let limit = self.max_accepted(frontier);
        let mut requests = Vec::new();

        let mut start = if self.has_gaps() {
            // look for the missing link from either side
            if rand::random::<bool>() {
                requests.push(HeadersRequest::by_number(frontier + size, max_size, true));
            } else {
                requests.push(HeadersRequest::by_number(frontier + 1, max_size, false));
            }
            self.max_num + 1
        } else {
            frontier + 1
        };

        while requests.len() < max_requests
            && start <= limit
            && self.header_count() + requests.len() * size as usize <= max_total
        {
            requests.push(HeadersRequest::by_number(start, max_size, false));
            start += size;
        }
        Some(requests)
    }

    fn add_headers(&mut self, mut headers: Vec<HeaderWithPeer>) -> Vec<HeaderWithPeer> {
        headers.sort_by_key(HeaderWithPeer::number);

        let committed = self.committed_number();
        let mut frontier = self.frontier();
        let mut tip = self.longest.last().copied();
        let mut added = Vec::new();

        for item in headers {
            let number = item.number();
            let hash = item.hash();
            if number <= committed || number > self.max_accepted(frontier) {
                trace!(number, hash = %short_hex(&hash), "Header out of range");
                continue;
            }
            let gen = self.headers.entry(number).or_default();
            if gen.contains_key(&hash) {
                continue;
            }
            gen.insert(
                hash,
                HeaderRecord { header: item.header.clone(), peer: Some(item.peer), body: None, exported: false },
            );
            if number == frontier + 1 && Some(item.header.parent_hash()) == tip {
                frontier = number;
                tip = Some(hash);
            }
            self.max_num = self.max_num.max(number);
            added.push(item);
        }

        if !added.is_empty() {
            self.recompute_longest();
            self.trim();
            debug!(added = added.len(), frontier = self.frontier(), max = self.max_num, "Headers added");
        }
        added
    }

    fn request_blocks(&mut self, max: usize) -> BlocksRequest {
        let mut headers = Vec::new();
        'outer: for (_, gen) in self.headers.range(self.last_exported + 1..) {
            for record in gen.values() {
                if headers.len() >= max {
                    break 'outer;
                }
                if record.exported || record.body.is_some() {
                    continue;
                }
                if let Some(peer) = record.peer {
                    headers.push(HeaderWithPeer::new(record.header.clone(), peer));
                }
            }
        }
        BlocksRequest { headers }
    }

    fn add_blocks(&mut self, blocks: Vec<Block>) -> Vec<BlockWithPeer> {
        for block in blocks {
            let hash = block.hash();
            let number = block.number();
            match self.headers.get_mut(&number).and_then(|gen| gen.get_mut(&hash)) {
                Some(record) if !record.exported && record.body.is_none() => record.body = Some(block.body),
                Some(_) => {}
                None => trace!(number, hash = %short_hex(&hash), "Body for unknown header"),
            }
        }
        self.export()
    }

    fn header_count(&self) -> usize {
        self.headers.values().flat_map(|gen| gen.values()).filter(|r| !r.exported).count()
    }

    fn body_count(&self) -> usize {
        self.headers.values().flat_map(|gen| gen.values()).filter(|r| !r.exported && r.body.is_some()).count()
    }
}
