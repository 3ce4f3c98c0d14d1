//! Queue walking backward from a known tip hash.
//!
//! Each header must be the parent of the one above it; the first header that
//! breaks the link ends the accepted segment and is requested again from the
//! break point. Blocks are exported from the top down.

use std::collections::BTreeMap;

use rusty_sync_types::{Block, BlockBody, BlockNumber, Hash, SealedHeader};
use tracing::{debug, warn};

use super::{BlockWithPeer, BlocksRequest, HeaderWithPeer, HeadersRequest, SyncQueue, ValidatedHeaders};
use crate::error::ValidationError;

/// Length of the prefix of `headers` (sorted from highest to lowest) that
/// links down from `expected`, plus the error at the first break.
pub fn check_descending(expected: Hash, headers: &[SealedHeader]) -> (usize, Option<ValidationError>) {
    let mut want = expected;
    for (i, header) in headers.iter().enumerate() {
        if header.hash() != want {
            return (i, Some(ValidationError::ChainBreak { expected: want, found: header.hash() }));
        }
        want = header.parent_hash();
    }
    (headers.len(), None)
}

#[derive(Debug)]
struct Fetched {
    header: HeaderWithPeer,
    body: Option<BlockBody>,
}

#[derive(Debug)]
pub struct ReverseSyncQueue {
    expected_hash: Hash,
    expected_number: BlockNumber,
    /// Lowest block wanted
    stop_number: BlockNumber,
    /// Next block to export, walking down
    next_export: BlockNumber,
    headers_done: bool,
    exported_all: bool,
    fetched: BTreeMap<BlockNumber, Fetched>,
}

impl ReverseSyncQueue {
    /// Fetch the blocks from `tip_number` (whose hash is `tip_hash`) down to `stop_number`.
    pub fn new(tip_hash: Hash, tip_number: BlockNumber, stop_number: BlockNumber) -> Self {
        let stop_number = stop_number.min(tip_number);
        Self {
            expected_hash: tip_hash,
            expected_number: tip_number,
            stop_number,
            next_export: tip_number,
            headers_done: false,
            exported_all: false,
            fetched: BTreeMap::new(),
        }
    }

    pub fn expected_number(&self) -> BlockNumber {
        self.expected_number
    }

    pub fn stop_number(&self) -> BlockNumber {
        self.stop_number
    }
}

impl SyncQueue for ReverseSyncQueue {
    fn request_headers(
        &mut self,
        max_size: u32,
        _max_requests: usize,
        max_total: usize,
    ) -> Option<Vec<HeadersRequest>> {
        if self.headers_done {
            return None;
        }
        if self.header_count() >= max_total {
            return Some(Vec::new());
        }
        let remaining = self.expected_number - self.stop_number + 1;
        let count = remaining.min(u64::from(max_size.max(1))) as u32;
        Some(vec![HeadersRequest::by_hash(self.expected_hash, count, true)])
    }

    fn validate_headers(&self, mut headers: Vec<HeaderWithPeer>) -> ValidatedHeaders {
        headers.sort_by(|a, b| b.number().cmp(&a.number()));
        let sealed: Vec<SealedHeader> = headers.iter().map(|h| h.header.clone()).collect();
        match check_descending(self.expected_hash, &sealed) {
            (_, None) => ValidatedHeaders::valid(headers),
            (valid, Some(err)) => {
                let peer = headers[valid].peer;
                headers.truncate(valid);
                ValidatedHeaders { headers, invalid_peer: Some(peer), reason: Some(err.to_string()) }
            }
        }
    }

    fn add_headers(&mut self, mut headers: Vec<HeaderWithPeer>) -> Vec<HeaderWithPeer> {
        headers.sort_by(|a, b| b.number().cmp(&a.number()));
        let mut added = Vec::new();
        for header in headers {
            if self.headers_done || header.hash() != self.expected_hash {
                continue;
            }
            if header.number() != self.expected_number {
                warn!(number = header.number(), expected = self.expected_number, "Header number does not match link");
                break;
            }
            self.expected_hash = header.header.parent_hash();
            if header.number() <= self.stop_number {
                self.headers_done = true;
            } else {
                self.expected_number -= 1;
            }
            self.fetched.insert(header.number(), Fetched { header: header.clone(), body: None });
            added.push(header);
        }
        if !added.is_empty() {
            debug!(added = added.len(), next = self.expected_number, stop = self.stop_number, "Reverse headers added");
        }
        added
    }

    fn request_blocks(&mut self, max: usize) -> BlocksRequest {
        let headers =
            self.fetched.values().rev().filter(|f| f.body.is_none()).take(max).map(|f| f.header.clone()).collect();
        BlocksRequest { headers }
    }

    fn add_blocks(&mut self, blocks: Vec<Block>) -> Vec<BlockWithPeer> {
        for block in blocks {
            if let Some(fetched) = self.fetched.get_mut(&block.number()) {
                if fetched.header.hash() == block.hash() {
                    fetched.body = Some(block.body);
                }
            }
        }

        let mut exported = Vec::new();
        while !self.exported_all {
            let ready = self.fetched.get(&self.next_export).map_or(false, |f| f.body.is_some());
            if !ready {
                break;
            }
            let Some(Fetched { header, body }) = self.fetched.remove(&self.next_export) else { break };
            let peer = Some(header.peer);
            exported.push(BlockWithPeer { block: Block::new(header.header.into_header(), body.unwrap_or_default()), peer });
            if self.next_export <= self.stop_number {
                self.exported_all = true;
            } else {
                self.next_export -= 1;
            }
        }
        exported
    }

    fn header_count(&self) -> usize {
        self.fetched.len()
    }

    fn body_count(&self) -> usize {
        self.fetched.values().filter(|f| f.body.is_some()).count()
    }

    fn is_complete(&self) -> bool {
        self.exported_all
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusty_sync_types::{BlockHeader, PeerId, U256};

    fn chain(len: u64) -> Vec<SealedHeader> {
        let mut parent = [0u8; 32];
        (0..len)
            .map(|number| {
                let header = BlockHeader {
                    parent_hash: parent,
                    ommers_hash: [0; 32],
                    beneficiary: [0; 20],
                    state_root: [0; 32],
                    transactions_root: [0; 32],
                    receipts_root: [0; 32],
                    difficulty: U256::from(10),
                    number,
                    gas_limit: 100,
                    gas_used: 0,
                    timestamp: number,
                    extra_data: vec![],
                    nonce: 0,
                }
                .seal();
                parent = header.hash();
                header
            })
            .collect()
    }

    fn wrap(headers: &[SealedHeader], peer: u8) -> Vec<HeaderWithPeer> {
        headers.iter().cloned().map(|h| HeaderWithPeer::new(h, PeerId([peer; 32]))).collect()
    }

    #[test]
    fn test_walks_down_to_stop_number() {
        let headers = chain(20);
        let mut queue = ReverseSyncQueue::new(headers[19].hash(), 19, 10);
        let requests = queue.request_headers(4, 1, 1_000).unwrap();
        assert_eq!(requests, vec![HeadersRequest::by_hash(headers[19].hash(), 4, true)]);

        queue.add_headers(wrap(&headers[16..20], 1));
        assert_eq!(queue.expected_number(), 15);
        queue.add_headers(wrap(&headers[8..16], 1));
        assert!(queue.request_headers(4, 1, 1_000).is_none());
        assert_eq!(queue.header_count(), 10);

        let blocks: Vec<Block> =
            headers[10..20].iter().rev().map(|h| Block::new(h.header().clone(), BlockBody::default())).collect();
        let exported = queue.add_blocks(blocks);
        let numbers: Vec<u64> = exported.iter().map(|b| b.block.number()).collect();
        assert_eq!(numbers, (10..20).rev().collect::<Vec<_>>());
        assert!(queue.is_complete());
    }

    #[test]
    fn test_chain_break_truncates_and_flags_peer() {
        let headers = chain(10);
        let queue = ReverseSyncQueue::new(headers[9].hash(), 9, 0);

        // header 6 is missing, so header 5 does not link to 7
        let mut batch = wrap(&headers[7..10], 1);
        batch.extend(wrap(&headers[5..6], 2));
        let validated = queue.validate_headers(batch);
        assert_eq!(validated.headers.len(), 3);
        assert_eq!(validated.invalid_peer, Some(PeerId([2; 32])));
    }

    #[test]
    fn test_check_descending_reports_break() {
        let headers = chain(5);
        let descending: Vec<SealedHeader> = headers.iter().rev().cloned().collect();
        assert_eq!(check_descending(headers[4].hash(), &descending), (5, None));
        let (valid, err) = check_descending([3; 32], &descending);
        assert_eq!(valid, 0);
        assert!(err.is_some());
    }
}
