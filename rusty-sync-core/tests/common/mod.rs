//! In-memory collaborators shared by the integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rusty_sync_core::{
    ChainStore, ImportResult, StateStore, SyncError, SyncListener, SyncMode, SyncResult, TransportError,
};
use rusty_sync_core::SyncNetwork;
use rusty_sync_p2p::PeerInfo;
use rusty_sync_types::{
    receipts_root, Block, BlockBodies, BlockBody, BlockHeader, BlockHeaders, BlockNumber, BlockReceipts, GetBodies,
    GetHeaders, GetReceipts, GetTrieNodes, Hash, HeaderStart, PeerId, Receipt, SealedHeader, TrieNodes, U256,
};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

pub fn peer(n: u8) -> PeerId {
    PeerId([n; 32])
}

pub fn peer_info(n: u8, total_difficulty: u64, best: &SealedHeader) -> PeerInfo {
    let address: SocketAddr = format!("127.0.0.1:{}", 30000 + u16::from(n)).parse().unwrap();
    let mut info = PeerInfo::new(peer(n), address, U256::from(total_difficulty), best.hash(), 63);
    info.best_number = Some(best.number());
    info
}

pub fn receipts_for(number: BlockNumber) -> Vec<Receipt> {
    vec![Receipt(number.to_le_bytes().to_vec())]
}

pub fn header(number: u64, parent_hash: Hash, salt: u64, state_root: Hash) -> SealedHeader {
    let body = BlockBody::default();
    BlockHeader {
        parent_hash,
        ommers_hash: body.ommers_hash(),
        beneficiary: [0; 20],
        state_root,
        transactions_root: body.transactions_root(),
        receipts_root: receipts_root(&receipts_for(number)),
        difficulty: U256::from(100),
        number,
        gas_limit: 1_000_000,
        gas_used: 0,
        timestamp: 1_000 + number * 10,
        extra_data: vec![],
        nonce: salt,
    }
    .seal()
}

pub fn genesis() -> SealedHeader {
    header(0, [0; 32], 0, [0; 32])
}

/// `len` headers on top of `parent`; `salt` separates competing branches.
pub fn extend(parent: &SealedHeader, len: usize, salt: u64) -> Vec<SealedHeader> {
    let mut out = Vec::with_capacity(len);
    let mut parent = parent.clone();
    for _ in 0..len {
        let next = header(parent.number() + 1, parent.hash(), salt, [0; 32]);
        out.push(next.clone());
        parent = next;
    }
    out
}

/// Genesis followed by `len` blocks.
pub fn chain(len: usize) -> Vec<SealedHeader> {
    let genesis = genesis();
    let mut headers = vec![genesis.clone()];
    headers.extend(extend(&genesis, len, 0));
    headers
}

pub fn block(header: &SealedHeader) -> Block {
    Block::new(header.header().clone(), BlockBody::default())
}

/// Serves a fixed chain and a fixed trie node set to every peer.
#[derive(Default)]
pub struct MockNetwork {
    by_number: Mutex<HashMap<BlockNumber, SealedHeader>>,
    by_hash: Mutex<HashMap<Hash, SealedHeader>>,
    nodes: Mutex<HashMap<Hash, Vec<u8>>>,
    /// Peers answering every header request with a broken chain
    broken_peers: Mutex<HashSet<PeerId>>,
    /// Delay applied to the first trie node calls, in call order
    trie_delays: Mutex<Vec<Duration>>,
    /// Corrupt the bytes of this many trie node answers
    corrupt_trie_answers: AtomicUsize,
    pub trie_calls: AtomicUsize,
    pub header_calls: AtomicUsize,
    pub node_requests: Mutex<HashMap<Hash, usize>>,
}

impl MockNetwork {
    pub fn new(headers: &[SealedHeader]) -> Arc<Self> {
        let network = Self::default();
        network.add_headers(headers);
        Arc::new(network)
    }

    pub fn add_headers(&self, headers: &[SealedHeader]) {
        let mut by_number = self.by_number.lock();
        let mut by_hash = self.by_hash.lock();
        for header in headers {
            by_number.insert(header.number(), header.clone());
            by_hash.insert(header.hash(), header.clone());
        }
    }

    pub fn add_nodes(&self, nodes: impl IntoIterator<Item = (Hash, Vec<u8>)>) {
        self.nodes.lock().extend(nodes);
    }

    pub fn set_broken(&self, peer: PeerId) {
        self.broken_peers.lock().insert(peer);
    }

    pub fn delay_trie_calls(&self, delays: Vec<Duration>) {
        *self.trie_delays.lock() = delays;
    }

    pub fn corrupt_trie_answers(&self, count: usize) {
        self.corrupt_trie_answers.store(count, Ordering::SeqCst);
    }

    pub fn requests_for(&self, hash: &Hash) -> usize {
        self.node_requests.lock().get(hash).copied().unwrap_or(0)
    }

    fn headers_from(&self, request: &GetHeaders) -> Vec<BlockHeader> {
        let by_number = self.by_number.lock();
        let start = match request.start {
            HeaderStart::Number(n) => n,
            HeaderStart::Hash(hash) => match self.by_hash.lock().get(&hash) {
                Some(header) => header.number(),
                None => return Vec::new(),
            },
        };
        let step = u64::from(request.skip) + 1;
        let mut out = Vec::new();
        let mut number = Some(start);
        while let Some(n) = number {
            if out.len() >= request.max_headers as usize {
                break;
            }
            let Some(header) = by_number.get(&n) else { break };
            out.push(header.header().clone());
            number = if request.reverse { n.checked_sub(step) } else { n.checked_add(step) };
        }
        out
    }
}

#[async_trait]
impl SyncNetwork for MockNetwork {
    async fn get_headers(&self, peer: PeerId, request: GetHeaders) -> Result<BlockHeaders, TransportError> {
        self.header_calls.fetch_add(1, Ordering::SeqCst);
        let mut headers = self.headers_from(&request);
        if self.broken_peers.lock().contains(&peer) {
            for header in headers.iter_mut() {
                header.parent_hash = [0xee; 32];
            }
        }
        Ok(BlockHeaders { headers })
    }

    async fn get_bodies(&self, _peer: PeerId, request: GetBodies) -> Result<BlockBodies, TransportError> {
        let by_hash = self.by_hash.lock();
        let bodies = request.hashes.iter().take_while(|h| by_hash.contains_key(*h)).map(|_| BlockBody::default()).collect();
        Ok(BlockBodies { bodies })
    }

    async fn get_trie_nodes(&self, _peer: PeerId, request: GetTrieNodes) -> Result<TrieNodes, TransportError> {
        let call = self.trie_calls.fetch_add(1, Ordering::SeqCst);
        {
            let mut counts = self.node_requests.lock();
            for hash in &request.hashes {
                *counts.entry(*hash).or_default() += 1;
            }
        }
        let delay = self.trie_delays.lock().get(call).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let corrupt = self
            .corrupt_trie_answers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        let nodes = self.nodes.lock();
        let nodes = request
            .hashes
            .iter()
            .filter_map(|hash| nodes.get(hash).map(|bytes| (*hash, bytes.clone())))
            .map(|(hash, mut bytes)| {
                if corrupt {
                    bytes.push(0xff);
                }
                (hash, bytes)
            })
            .collect();
        Ok(TrieNodes { nodes })
    }

    async fn get_receipts(&self, _peer: PeerId, request: GetReceipts) -> Result<BlockReceipts, TransportError> {
        let by_hash = self.by_hash.lock();
        let receipts = request
            .block_hashes
            .iter()
            .map_while(|hash| by_hash.get(hash).map(|h| receipts_for(h.number())))
            .collect();
        Ok(BlockReceipts { receipts })
    }
}

/// Linear chain that imports a block only on top of its best block.
pub struct MockChain {
    blocks: Mutex<Vec<Block>>,
    total_difficulty: Mutex<U256>,
    pub persisted: Mutex<Vec<(BlockNumber, U256)>>,
    pub receipts: Mutex<HashMap<Hash, Vec<Receipt>>>,
    pub imports: AtomicUsize,
    /// Refuse every `persist_block` once set
    failing_writes: AtomicBool,
}

impl MockChain {
    pub fn new(headers: &[SealedHeader]) -> Arc<Self> {
        Arc::new(Self {
            blocks: Mutex::new(headers.iter().map(block).collect()),
            total_difficulty: Mutex::new(U256::from(headers.len() as u64 * 100)),
            persisted: Mutex::new(Vec::new()),
            receipts: Mutex::new(HashMap::new()),
            imports: AtomicUsize::new(0),
            failing_writes: AtomicBool::new(false),
        })
    }

    pub fn fail_writes(&self) {
        self.failing_writes.store(true, Ordering::SeqCst);
    }

    pub fn numbers(&self) -> Vec<BlockNumber> {
        self.blocks.lock().iter().map(Block::number).collect()
    }
}

impl ChainStore for MockChain {
    fn best_header(&self) -> SealedHeader {
        let blocks = self.blocks.lock();
        blocks.last().map(|b| b.header.clone().seal()).unwrap_or_else(genesis)
    }

    fn total_difficulty(&self) -> U256 {
        *self.total_difficulty.lock()
    }

    fn block_by_number(&self, number: BlockNumber) -> Option<Block> {
        self.blocks.lock().iter().find(|b| b.number() == number).cloned()
    }

    fn block_by_hash(&self, hash: &Hash) -> Option<Block> {
        self.blocks.lock().iter().find(|b| b.hash() == *hash).cloned()
    }

    fn import_block(&self, block: &Block) -> ImportResult {
        self.imports.fetch_add(1, Ordering::SeqCst);
        let mut blocks = self.blocks.lock();
        if blocks.iter().any(|b| b.hash() == block.hash()) {
            return ImportResult::Exists;
        }
        match blocks.last() {
            Some(best) if best.hash() == block.parent_hash() => {
                blocks.push(block.clone());
                *self.total_difficulty.lock() += block.header.difficulty;
                ImportResult::ImportedBest
            }
            _ => ImportResult::NoParent,
        }
    }

    fn persist_block(&self, block: &Block, total_difficulty: U256) -> SyncResult<()> {
        if self.failing_writes.load(Ordering::SeqCst) {
            return Err(SyncError::Store(format!("cannot write block {}", block.number())));
        }
        self.persisted.lock().push((block.number(), total_difficulty));
        Ok(())
    }

    fn persist_receipts(&self, block_hash: Hash, receipts: Vec<Receipt>) -> SyncResult<()> {
        self.receipts.lock().insert(block_hash, receipts);
        Ok(())
    }

    fn set_best_block(&self, block: &Block, total_difficulty: U256) -> SyncResult<()> {
        self.blocks.lock().push(block.clone());
        *self.total_difficulty.lock() = total_difficulty;
        Ok(())
    }
}

#[derive(Default)]
pub struct MockState {
    nodes: Mutex<HashMap<Hash, Vec<u8>>>,
    pub writes: Mutex<HashMap<Hash, usize>>,
    pub flushes: AtomicUsize,
}

impl MockState {
    pub fn len(&self) -> usize {
        self.nodes.lock().len()
    }

    pub fn get(&self, hash: &Hash) -> Option<Vec<u8>> {
        self.nodes.lock().get(hash).cloned()
    }

    pub fn writes_of(&self, hash: &Hash) -> usize {
        self.writes.lock().get(hash).copied().unwrap_or(0)
    }
}

impl StateStore for MockState {
    fn contains(&self, hash: &Hash) -> bool {
        self.nodes.lock().contains_key(hash)
    }

    fn put_batch(&self, nodes: Vec<(Hash, Vec<u8>)>) -> SyncResult<()> {
        let mut stored = self.nodes.lock();
        let mut writes = self.writes.lock();
        for (hash, bytes) in nodes {
            *writes.entry(hash).or_default() += 1;
            stored.insert(hash, bytes);
        }
        Ok(())
    }

    fn flush(&self) -> SyncResult<()> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingListener {
    pub done: Mutex<Vec<SyncMode>>,
}

impl SyncListener for RecordingListener {
    fn on_sync_done(&self, mode: SyncMode) {
        self.done.lock().push(mode);
    }
}

/// Poll `check` on the paused clock until it holds or `limit` passes.
pub async fn eventually(limit: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    check()
}
