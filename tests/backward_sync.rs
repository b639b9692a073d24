//! Backward-sync scenario: after a checkpoint is installed, blocks stream in
//! from a peer in reverse order until the gap down to genesis closes.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use num_bigint::BigUint;

use bc_node::blockpool::BlockPool;
use bc_node::genesis::{bootstrap, genesis_block};
use bc_node::pubsub::{PubSub, TOPIC_STATE_CHECKPOINT_END};
use bc_node::storage::{keys, Store};
use bc_node::ParentBlock;

/// A linked chain descending from genesis, heights 2..=2+len-1.
fn chain_from_genesis(len: u64) -> Vec<ParentBlock> {
    let mut out: Vec<ParentBlock> = Vec::new();
    for i in 0..len {
        let parent = out.last().unwrap_or(genesis_block());
        let mut block = genesis_block().clone();
        block.height = parent.height + 1;
        block.previous_hash = parent.hash.clone();
        block.timestamp = parent.timestamp + 6;
        block.distance = BigUint::from(10u8);
        block.total_distance = &parent.total_distance + 10u32;
        block.merkle_root = bc_node::hashing::blake2bl(&format!("sync-block-{}", i));
        block.hash = block.expected_hash();
        out.push(block);
    }
    out
}

#[test]
fn reverse_stream_closes_the_gap_and_publishes_checkpoint_end() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Store::open(dir.path().to_str().unwrap()).expect("open");
    bootstrap(&store).expect("bootstrap");

    let chain = chain_from_genesis(8); // heights 2..=9
    let checkpoint = chain.last().unwrap().clone();

    let mut bus = PubSub::new();
    let completed = Arc::new(AtomicUsize::new(0));
    {
        let completed = Arc::clone(&completed);
        bus.subscribe(TOPIC_STATE_CHECKPOINT_END, move |msg| {
            assert!(msg.data.is_some(), "completion carries the connector");
            completed.fetch_add(1, Ordering::SeqCst);
        });
    }

    let mut pool = BlockPool::new();
    pool.purge(&store, checkpoint.clone()).expect("checkpoint");
    assert_eq!(pool.checkpoint().map(|c| c.height), Some(9));

    // Heights 8,7,...,3 connect one by one; the frontier follows them down.
    for block in chain[1..chain.len() - 1].iter().rev() {
        pool.add(&store, &bus, block.clone()).expect("add");
        let earliest: ParentBlock = store
            .get(keys::BLOCK_EARLIEST)
            .expect("read")
            .expect("frontier present");
        assert_eq!(earliest.height, block.height);
    }
    assert_eq!(completed.load(Ordering::SeqCst), 0, "gap still open");

    // The height-2 connector descends from genesis: sync is complete.
    pool.add(&store, &bus, chain[0].clone()).expect("connector");
    assert_eq!(completed.load(Ordering::SeqCst), 1);
    assert!(
        store
            .get::<ParentBlock>(keys::BLOCK_EARLIEST)
            .expect("read")
            .is_none(),
        "frontier marker removed on completion"
    );

    // Every gap height is now on disk.
    for block in &chain[..chain.len() - 1] {
        let stored: ParentBlock = store
            .get(&keys::block_at(block.height))
            .expect("read")
            .expect("persisted");
        assert_eq!(stored.hash, block.hash);
    }
}

#[test]
fn checkpoint_purge_clears_stale_canonical_range() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Store::open(dir.path().to_str().unwrap()).expect("open");
    bootstrap(&store).expect("bootstrap");

    // Pretend an old chain had been persisted up to height 6.
    let old_chain = chain_from_genesis(5); // heights 2..=6
    for block in &old_chain {
        store
            .put(&keys::block_at(block.height), block)
            .expect("seed");
    }

    let new_chain = chain_from_genesis(8);
    let checkpoint = new_chain.last().unwrap().clone(); // height 9
    let mut pool = BlockPool::new();
    pool.purge(&store, checkpoint).expect("purge");

    for h in 2..=8u64 {
        assert!(
            !store.contains(&keys::block_at(h)).expect("contains"),
            "stale height {} should have been purged",
            h
        );
    }
    assert!(
        store.contains(&keys::block_at(1)).expect("contains"),
        "genesis is never purged"
    );
}
