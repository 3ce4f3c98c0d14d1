mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use rusty_sync_core::{
    BasicHeaderValidator, BincodeTrieDecoder, ChainStore, SyncConfig, SyncContext, SyncEvent, SyncListener,
    SyncManager, SyncMode,
};
use rusty_sync_p2p::PeerPool;
use rusty_sync_types::SealedHeader;

struct Harness {
    manager: Arc<SyncManager>,
    pool: Arc<PeerPool>,
    network: Arc<MockNetwork>,
    chain: Arc<MockChain>,
    listener: Arc<RecordingListener>,
}

/// Local chain holds `headers[..=local]`, the network serves all of `headers`.
fn harness(headers: &[SealedHeader], local: usize) -> Harness {
    init_tracing();
    let config = SyncConfig::default();
    let pool = Arc::new(PeerPool::new(config.peer_pool.clone()));
    let network = MockNetwork::new(headers);
    let chain = MockChain::new(&headers[..=local]);
    let listener = Arc::new(RecordingListener::default());
    let ctx = SyncContext {
        pool: pool.clone(),
        network: network.clone(),
        chain: chain.clone(),
        state: Arc::new(MockState::default()),
        decoder: Arc::new(BincodeTrieDecoder),
        validator: Arc::new(BasicHeaderValidator::default()),
        listener: Some(listener.clone() as Arc<dyn SyncListener>),
    };
    let manager = SyncManager::new(config, ctx);
    Harness { manager, pool, network, chain, listener }
}

#[tokio::test(start_paused = true)]
async fn test_long_sync_catches_up_and_switches_to_short() {
    let headers = chain(50);
    let h = harness(&headers, 0);
    for n in 1..=3 {
        h.manager.add_peer(peer_info(n, 5_000, &headers[50])).unwrap();
    }

    h.manager.start();
    assert!(eventually(Duration::from_secs(60), || h.chain.best_number() == 50).await);
    assert!(eventually(Duration::from_secs(5), || h.manager.mode() == SyncMode::ShortSync).await);

    assert_eq!(h.chain.numbers(), (0..=50).collect::<Vec<u64>>());
    assert_eq!(*h.listener.done.lock(), vec![SyncMode::LongSync]);
    let status = h.manager.status();
    assert_eq!(status.local_best, 50);
    assert_eq!(status.best_known, 50);
    assert_eq!(status.active_peers, 3);
    assert!(status.fast_sync.is_none());

    h.manager.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_stays_in_long_sync_without_peers() {
    let headers = chain(2);
    let h = harness(&headers, 2);

    h.manager.handle_event(SyncEvent::BestKnownUpdated(2));

    assert_eq!(h.manager.mode(), SyncMode::LongSync);
    assert!(h.listener.done.lock().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_orphan_in_short_sync_triggers_gap_recovery() {
    let headers = chain(60);
    let h = harness(&headers, 40);
    h.pool.add(peer_info(1, 5_000, &headers[60])).unwrap();

    h.manager.handle_event(SyncEvent::BestKnownUpdated(42));
    assert_eq!(h.manager.mode(), SyncMode::ShortSync);

    h.manager.handle_event(SyncEvent::NoParent { block: block(&headers[60]), peer: Some(peer(1)) });

    assert!(eventually(Duration::from_secs(30), || h.chain.best_number() == 60).await);
    assert_eq!(h.chain.numbers(), (0..=60).collect::<Vec<u64>>());
    assert!(eventually(Duration::from_secs(5), || !h.manager.status().gap_recovery).await);
    assert!(!h.pool.is_banned(peer(1)));
    assert_eq!(h.manager.mode(), SyncMode::ShortSync);
}

#[tokio::test(start_paused = true)]
async fn test_master_with_broken_chain_is_banned() {
    let headers = chain(60);
    let h = harness(&headers, 40);
    h.pool.add(peer_info(1, 5_000, &headers[60])).unwrap();
    h.network.set_broken(peer(1));

    h.manager.handle_event(SyncEvent::BestKnownUpdated(41));
    h.manager.handle_event(SyncEvent::NoParent { block: block(&headers[60]), peer: Some(peer(1)) });

    assert!(eventually(Duration::from_secs(30), || h.pool.is_banned(peer(1))).await);
    assert_eq!(h.chain.best_number(), 40);
}

#[tokio::test(start_paused = true)]
async fn test_orphan_during_long_sync_is_dropped() {
    let headers = chain(60);
    let h = harness(&headers, 40);
    h.pool.add(peer_info(1, 5_000, &headers[60])).unwrap();

    h.manager.handle_event(SyncEvent::NoParent { block: block(&headers[60]), peer: Some(peer(1)) });
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(h.manager.mode(), SyncMode::LongSync);
    assert_eq!(h.chain.best_number(), 40);
    assert!(!h.manager.status().gap_recovery);
}
