//! Linear queue for a header range known to form a single chain.
//!
//! Used when both ends are known in advance: the start is a local header and
//! the end is a trusted number, optionally pinned to a hash. Headers are only
//! linked onto the current tip; headers that arrive ahead of the tip wait in a
//! detached set until the gap below them closes.

use std::collections::BTreeMap;

use rusty_sync_types::{Block, BlockBody, BlockNumber, Hash, PeerId};
use tracing::{debug, warn};

use super::{BlockWithPeer, BlocksRequest, HeaderWithPeer, HeadersRequest, SyncQueue, ValidatedHeaders};

#[derive(Debug)]
struct Linked {
    header: HeaderWithPeer,
    body: Option<BlockBody>,
}

#[derive(Debug)]
pub struct ForwardSyncQueue {
    end_number: BlockNumber,
    end_hash: Option<Hash>,
    tip_number: BlockNumber,
    tip_hash: Hash,
    last_exported: BlockNumber,
    linked: BTreeMap<BlockNumber, Linked>,
    detached: BTreeMap<BlockNumber, BTreeMap<Hash, HeaderWithPeer>>,
}

impl ForwardSyncQueue {
    /// Walk from the local header `start` up to `end_number`.
    pub fn new(start_number: BlockNumber, start_hash: Hash, end_number: BlockNumber, end_hash: Option<Hash>) -> Self {
        Self {
            end_number,
            end_hash,
            tip_number: start_number,
            tip_hash: start_hash,
            last_exported: start_number,
            linked: BTreeMap::new(),
            detached: BTreeMap::new(),
        }
    }

    pub fn tip_number(&self) -> BlockNumber {
        self.tip_number
    }

    fn accepts(&self, header: &HeaderWithPeer) -> bool {
        let number = header.number();
        if number <= self.tip_number || number > self.end_number {
            return false;
        }
        number != self.end_number || self.end_hash.map_or(true, |end| end == header.hash())
    }

    /// Move detached headers onto the tip while they link.
    fn link_detached(&mut self) {
        while let Some(gen) = self.detached.remove(&(self.tip_number + 1)) {
            let Some(next) = gen.into_values().find(|h| h.header.parent_hash() == self.tip_hash) else { break };
            self.tip_number = next.number();
            self.tip_hash = next.hash();
            self.linked.insert(next.number(), Linked { header: next, body: None });
        }
        let tip = self.tip_number;
        self.detached.retain(|number, _| *number > tip);
    }
}

impl SyncQueue for ForwardSyncQueue {
    fn request_headers(
        &mut self,
        max_size: u32,
        max_requests: usize,
        max_total: usize,
    ) -> Option<Vec<HeadersRequest>> {
        if self.tip_number >= self.end_number {
            return None;
        }
        let mut requests = Vec::new();
        let mut start = self.tip_number + 1;
        while requests.len() < max_requests && start <= self.end_number && self.header_count() < max_total {
            let count = (self.end_number - start + 1).min(u64::from(max_size.max(1))) as u32;
            requests.push(HeadersRequest::by_number(start, count, false));
            start += u64::from(count);
        }
        Some(requests)
    }

    fn validate_headers(&self, mut headers: Vec<HeaderWithPeer>) -> ValidatedHeaders {
        headers.sort_by_key(HeaderWithPeer::number);
        for i in 0..headers.len() {
            let bad_end = headers[i].number() == self.end_number
                && self.end_hash.map_or(false, |end| end != headers[i].hash());
            let broken = i > 0
                && headers[i].number() == headers[i - 1].number() + 1
                && headers[i].header.parent_hash() != headers[i - 1].hash();
            if bad_end || broken {
                let peer: PeerId = headers[i].peer;
                let reason = if bad_end { "end hash mismatch" } else { "parent hash mismatch" };
                headers.truncate(i);
                return ValidatedHeaders { headers, invalid_peer: Some(peer), reason: Some(reason.to_string()) };
            }
        }
        ValidatedHeaders::valid(headers)
    }

    fn add_headers(&mut self, headers: Vec<HeaderWithPeer>) -> Vec<HeaderWithPeer> {
        let mut added = Vec::new();
        for header in headers {
            if !self.accepts(&header) {
                continue;
            }
            let gen = self.detached.entry(header.number()).or_default();
            if gen.insert(header.hash(), header.clone()).is_none() {
                added.push(header);
            }
        }
        self.link_detached();
        if !added.is_empty() {
            debug!(added = added.len(), tip = self.tip_number, end = self.end_number, "Forward headers added");
        }
        added
    }

    fn request_blocks(&mut self, max: usize) -> BlocksRequest {
        let headers =
            self.linked.values().filter(|l| l.body.is_none()).take(max).map(|l| l.header.clone()).collect();
        BlocksRequest { headers }
    }

    fn add_blocks(&mut self, blocks: Vec<Block>) -> Vec<BlockWithPeer> {
        for block in blocks {
            match self.linked.get_mut(&block.number()) {
                Some(linked) if linked.header.hash() == block.hash() => linked.body = Some(block.body),
                _ => warn!(number = block.number(), "Body does not belong to the forward chain"),
            }
        }

        let mut exported = Vec::new();
        while let Some(entry) = self.linked.first_entry() {
            if *entry.key() != self.last_exported + 1 || entry.get().body.is_none() {
                break;
            }
            let Linked { header, body } = entry.remove();
            self.last_exported = header.number();
            let peer = Some(header.peer);
            let block = Block::new(header.header.into_header(), body.unwrap_or_default());
            exported.push(BlockWithPeer { block, peer });
        }
        exported
    }

    fn header_count(&self) -> usize {
        self.linked.len() + self.detached.values().map(BTreeMap::len).sum::<usize>()
    }

    fn body_count(&self) -> usize {
        self.linked.values().filter(|l| l.body.is_some()).count()
    }

    fn is_complete(&self) -> bool {
        self.last_exported >= self.end_number
    }
}
