//! End-to-end engine scenarios over a throwaway store, driving the event
//! queue by hand the way the runtime loop does.

use num_bigint::BigUint;
use tokio::sync::mpsc::UnboundedReceiver;

use bc_node::block::Solution;
use bc_node::chains::{ChildChain, ChildHeader};
use bc_node::clock::Clock;
use bc_node::engine::{Engine, EngineConfig, EngineEvent};
use bc_node::genesis::{bootstrap, genesis_block};
use bc_node::hashing::blake2bl;
use bc_node::storage::{keys, Store};
use bc_node::ParentBlock;

fn test_config() -> EngineConfig {
    EngineConfig {
        miner_address: "0xminer".to_string(),
        worker_enabled: false,
        persist_rover_data: false,
        p2p_passive: true,
        gossip_peers: Vec::new(),
        public_url: "http://127.0.0.1:9090".to_string(),
    }
}

fn spawn_engine() -> (
    tempfile::TempDir,
    Store,
    Engine,
    UnboundedReceiver<EngineEvent>,
) {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Store::open(dir.path().to_str().unwrap()).expect("open store");
    bootstrap(&store).expect("bootstrap");
    let (engine, _tx, rx) =
        Engine::new(store.clone(), Clock::new(), test_config()).expect("engine");
    (dir, store, engine, rx)
}

fn fresh_tip(chain: ChildChain, n: u64) -> ChildHeader {
    let base = genesis_block()
        .blockchain_headers
        .latest(chain)
        .expect("genesis tip")
        .clone();
    ChildHeader {
        hash: blake2bl(&format!("{}-observed-{}", chain, n)),
        previous_hash: base.hash.clone(),
        height: base.height + n,
        timestamp_ms: base.timestamp_ms + n * 60_000,
        confirmations_in_parent: 1,
        ..base
    }
}

/// Process everything the bus forwarded back onto the queue, exactly as the
/// runtime loop would.
async fn drain(engine: &mut Engine, rx: &mut UnboundedReceiver<EngineEvent>) {
    while let Ok(event) = rx.try_recv() {
        engine.handle(event).await.expect("queued event");
    }
}

#[tokio::test]
async fn genesis_bootstrap_writes_stable_height_one() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Store::open(dir.path().to_str().unwrap()).expect("open store");

    assert!(bootstrap(&store).expect("bootstrap"));

    let first: ParentBlock = store
        .get(&keys::block_at(1))
        .expect("read")
        .expect("height 1 present");
    let latest: ParentBlock = store
        .get(keys::BLOCK_LATEST)
        .expect("read")
        .expect("latest present");
    assert_eq!(first.hash, genesis_block().hash);
    assert_eq!(latest.hash, first.hash);

    // Re-reading yields byte-identical content.
    let again: ParentBlock = store
        .get(&keys::block_at(1))
        .expect("read")
        .expect("still present");
    assert_eq!(
        serde_json::to_vec(&first).expect("encode"),
        serde_json::to_vec(&again).expect("encode"),
    );
}

#[tokio::test]
async fn first_mine_flows_from_tips_to_persisted_block() {
    let (_dir, store, mut engine, mut rx) = spawn_engine();

    // One tip per rovered chain unlocks mining and assembles a candidate.
    for (i, chain) in ChildChain::ALL.iter().enumerate() {
        assert!(!engine.can_mine());
        engine
            .handle(EngineEvent::RoverTip {
                header: fresh_tip(*chain, i as u64 + 1),
            })
            .await
            .expect("tip");
    }
    assert!(engine.can_mine());
    let candidate = engine.candidate().cloned().expect("candidate assembled");
    assert_eq!(candidate.height, 2);
    assert_eq!(candidate.previous_hash, genesis_block().hash);

    // A worker solution beating the difficulty turns it into a real block.
    let solution = Solution {
        nonce: "0.7313581162763393".to_string(),
        distance: &candidate.difficulty + 424_242u32,
        timestamp: candidate.timestamp + 1,
        difficulty: candidate.difficulty.clone(),
        iterations: 313,
        time_diff_ms: 1_200,
    };
    engine
        .handle(EngineEvent::WorkerSolution(solution.clone()))
        .await
        .expect("solution");
    drain(&mut engine, &mut rx).await;

    let stored: ParentBlock = store
        .get(&keys::block_at(2))
        .expect("read")
        .expect("mined block persisted");
    assert_eq!(stored.nonce, solution.nonce);
    assert_eq!(stored.distance, solution.distance);
    assert_eq!(
        stored.total_distance,
        &genesis_block().total_distance + &solution.distance
    );

    let latest: ParentBlock = store
        .get(keys::BLOCK_LATEST)
        .expect("read")
        .expect("tip updated");
    assert_eq!(latest.hash, stored.hash);
    assert!(engine.candidate().is_none(), "candidate consumed");
}

#[tokio::test]
async fn next_tip_after_mine_builds_on_new_block() {
    let (_dir, store, mut engine, mut rx) = spawn_engine();
    for (i, chain) in ChildChain::ALL.iter().enumerate() {
        engine
            .handle(EngineEvent::RoverTip {
                header: fresh_tip(*chain, i as u64 + 1),
            })
            .await
            .expect("tip");
    }
    let candidate = engine.candidate().cloned().expect("candidate");
    let solution = Solution {
        nonce: "0.1".to_string(),
        distance: &candidate.difficulty + BigUint::from(1u8),
        timestamp: candidate.timestamp + 1,
        difficulty: candidate.difficulty.clone(),
        iterations: 1,
        time_diff_ms: 10,
    };
    engine
        .handle(EngineEvent::WorkerSolution(solution))
        .await
        .expect("solution");
    drain(&mut engine, &mut rx).await;

    let mined: ParentBlock = store
        .get(keys::BLOCK_LATEST)
        .expect("read")
        .expect("tip");
    assert_eq!(mined.height, 2);

    // The next rover tip assembles a candidate on top of the mined block.
    engine
        .handle(EngineEvent::RoverTip {
            header: fresh_tip(ChildChain::Btc, 50),
        })
        .await
        .expect("tip");
    drain(&mut engine, &mut rx).await;
    let next = engine.candidate().cloned().expect("next candidate");
    assert_eq!(next.height, 3);
    assert_eq!(next.previous_hash, mined.hash);
}

#[tokio::test]
async fn orphan_published_height_is_persisted_anyway() {
    let (_dir, store, mut engine, mut rx) = spawn_engine();

    // A block whose previous_hash matches nothing on disk.
    let mut orphan = genesis_block().clone();
    orphan.height = 5;
    orphan.previous_hash = blake2bl("somewhere-else");
    orphan.hash = orphan.expected_hash();
    orphan.total_distance = BigUint::from(5_000u32);

    engine
        .handle(EngineEvent::Bus {
            topic: "state.block.height".to_string(),
            msg: bc_node::pubsub::BusMessage::block(orphan.clone()),
        })
        .await
        .expect("bus");
    drain(&mut engine, &mut rx).await;

    let stored: ParentBlock = store
        .get(&keys::block_at(5))
        .expect("read")
        .expect("orphan still persisted");
    assert_eq!(stored.hash, orphan.hash);
}

#[tokio::test]
async fn multiverse_snapshot_reply_arrives() {
    let (_dir, _store, mut engine, _rx) = spawn_engine();
    let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
    engine
        .handle(EngineEvent::MultiverseSnapshot { reply: reply_tx })
        .await
        .expect("snapshot");
    let blocks = reply_rx.await.expect("reply");
    assert_eq!(blocks.len(), 1, "only genesis is known at startup");
    assert_eq!(blocks[0].hash, genesis_block().hash);
}
