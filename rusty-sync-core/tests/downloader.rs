mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::*;
use rusty_sync_core::{
    BasicHeaderValidator, BlockDownloader, DagSyncQueue, DownloaderConfig, ForwardSyncQueue, QueueConfig,
};
use rusty_sync_p2p::{PeerPool, PeerPoolConfig};
use tokio::sync::mpsc;

fn pool_with(peers: u8, best: &rusty_sync_types::SealedHeader) -> Arc<PeerPool> {
    let pool = Arc::new(PeerPool::new(PeerPoolConfig::default()));
    for n in 1..=peers {
        pool.add(peer_info(n, 5_000, best)).unwrap();
    }
    pool
}

#[tokio::test(start_paused = true)]
async fn test_dag_downloader_exports_the_chain_in_order() {
    init_tracing();
    let headers = chain(50);
    let pool = pool_with(3, &headers[50]);
    let network = MockNetwork::new(&headers);
    let (tx, mut rx) = mpsc::channel(16);
    let downloader = BlockDownloader::new(
        "blocks",
        DownloaderConfig::default(),
        DagSyncQueue::new(headers[0].clone(), &QueueConfig::default()),
        pool.clone(),
        network,
        Arc::new(BasicHeaderValidator::default()),
        tx,
    );
    let handles = downloader.start();

    let mut numbers = Vec::new();
    while numbers.len() < 50 {
        let batch = tokio::time::timeout(Duration::from_secs(60), rx.recv()).await.unwrap().unwrap();
        numbers.extend(batch.into_iter().map(|b| b.block.number()));
    }
    downloader.stop();

    assert_eq!(numbers, (1..=50).collect::<Vec<u64>>());
    assert_eq!(downloader.stats().blocks_exported, 50);
    assert_eq!(downloader.stats().invalid_responses, 0);
    for handle in handles {
        handle.await.unwrap();
    }
}

#[tokio::test(start_paused = true)]
async fn test_header_requests_stay_bounded_at_the_head() {
    init_tracing();
    let headers = chain(50);
    let pool = pool_with(3, &headers[50]);
    let network = MockNetwork::new(&headers);
    let (tx, mut rx) = mpsc::channel(16);
    let config = DownloaderConfig::default();
    let header_wait = config.header_wait(false);
    let downloader = BlockDownloader::new(
        "blocks",
        config,
        DagSyncQueue::new(headers[0].clone(), &QueueConfig::default()),
        pool.clone(),
        network.clone(),
        Arc::new(BasicHeaderValidator::default()),
        tx,
    );
    downloader.start();

    let mut exported = 0;
    while exported < 50 {
        let batch = tokio::time::timeout(Duration::from_secs(60), rx.recv()).await.unwrap().unwrap();
        exported += batch.len();
    }

    // nothing new above the tip: one round of empty answers per header wait
    let before = network.header_calls.load(Ordering::SeqCst);
    let rounds = 10;
    tokio::time::sleep(header_wait * rounds).await;
    let calls = network.header_calls.load(Ordering::SeqCst) - before;
    let per_round = DownloaderConfig::default().max_header_requests as u32;
    assert!(calls <= ((rounds + 1) * per_round) as usize, "{calls} header requests while idle");

    // a block that appears later is still picked up
    let next = extend(&headers[50], 1, 0);
    network.add_headers(&next);
    downloader.wake();
    let batch = tokio::time::timeout(Duration::from_secs(30), rx.recv()).await.unwrap().unwrap();
    assert_eq!(batch[0].block.hash(), next[0].hash());
    downloader.stop();
}

#[tokio::test(start_paused = true)]
async fn test_forward_downloader_penalises_broken_peer_and_completes() {
    init_tracing();
    let headers = chain(60);
    let pool = pool_with(3, &headers[60]);
    let network = MockNetwork::new(&headers);
    network.set_broken(peer(3));
    let config = DownloaderConfig { max_headers_per_request: 10, ..DownloaderConfig::default() };
    let (tx, mut rx) = mpsc::channel(64);
    let downloader = BlockDownloader::new(
        "forward",
        config,
        ForwardSyncQueue::new(0, headers[0].hash(), 60, Some(headers[60].hash())),
        pool.clone(),
        network,
        Arc::new(BasicHeaderValidator::default()),
        tx,
    );
    downloader.start();

    tokio::time::timeout(Duration::from_secs(120), downloader.wait_complete()).await.unwrap();
    downloader.stop();

    let mut numbers = Vec::new();
    while let Ok(batch) = rx.try_recv() {
        numbers.extend(batch.into_iter().map(|b| b.block.number()));
    }
    assert_eq!(numbers, (1..=60).collect::<Vec<u64>>());

    assert!(downloader.stats().invalid_responses >= 1);
    let reported = pool.get_by_id(peer(3)).map_or(0, |p| p.stats.invalid_responses);
    assert!(pool.is_banned(peer(3)) || reported >= 1);
    assert!(!pool.is_banned(peer(1)));
}

#[tokio::test(start_paused = true)]
async fn test_new_block_on_top_is_exported_immediately() {
    init_tracing();
    let headers = chain(3);
    let pool = pool_with(1, &headers[3]);
    let network = MockNetwork::new(&headers[..1]);
    let (tx, mut rx) = mpsc::channel(4);
    let downloader = BlockDownloader::new(
        "blocks",
        DownloaderConfig::default(),
        DagSyncQueue::new(headers[0].clone(), &QueueConfig::default()),
        pool,
        network,
        Arc::new(BasicHeaderValidator::default()),
        tx,
    );

    assert!(downloader.validate_and_add_new_block(block(&headers[1]), peer(1)).await);
    let exported = rx.try_recv().unwrap();
    assert_eq!(exported.len(), 1);
    assert_eq!(exported[0].block.hash(), headers[1].hash());
    assert_eq!(exported[0].peer, Some(peer(1)));

    // a block whose body does not match its header is refused
    let mut tampered = block(&headers[2]);
    tampered.header.transactions_root = [9; 32];
    assert!(!downloader.validate_and_add_new_block(tampered, peer(1)).await);
    assert_eq!(downloader.stats().invalid_responses, 1);
}
