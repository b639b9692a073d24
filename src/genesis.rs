//! Canonical height-1 block built from static data.

use num_bigint::BigUint;
use once_cell::sync::Lazy;

use crate::block::ParentBlock;
use crate::chains::{ChildChain, ChildHeader, ChildHeaderMap};
use crate::errors::NodeResult;
use crate::hashing::blake2bl;
use crate::mining::difficulty::minimum_difficulty;
use crate::mining::work::{child_chain_root, merkle_root};
use crate::storage::{keys, Store};

/// Canonical hash of the height-1 block.
///
/// This value MUST match the hash computed from the static genesis data
/// below. Do not change it unless performing a network reset; every node
/// must start from the same genesis identity.
pub const GENESIS_HASH: &str = "c2afa918987637bc5177f0af21e6cfedfaa65a1e744ff3706d9abf3aa3f6a93e";

pub const GENESIS_HEIGHT: u64 = 1;
pub const GENESIS_TIMESTAMP: u64 = 1_530_000_000;
pub const GENESIS_MINER: &str = "0x083cf8e4d9b1a1e7d4fa2d08aa0a5c4a1b2f9e62";
pub const GENESIS_NRG_GRANT: u64 = 1_600_000_000;
pub const GENESIS_EMBLEM_WEIGHT: u64 = 6757;
pub const GENESIS_EMBLEM_CHAIN_ADDRESS: &str = "0x28b94f58b11ac945341329dbf2e5ef7f8bd44225";
pub const GENESIS_TX_FEE_BASE: u64 = 1;
pub const GENESIS_TX_DISTANCE_SUM_LIMIT: u64 = 42;

// First observed tip per rovered chain, frozen at network launch.
const GENESIS_CHILD_TIPS: [(ChildChain, &str, u64, u64); 5] = [
    (
        ChildChain::Btc,
        "0000000000000000001b5ac86f268f3d32b72bbd86adba0f3fc5b9d4d2b9c3b0",
        530_500,
        1_529_998_000_000,
    ),
    (
        ChildChain::Eth,
        "44e2715bb42232ac73e478c2a45b3d77a73b3b925cba9ac81d818a13fbc01b43",
        5_900_000,
        1_529_998_100_000,
    ),
    (
        ChildChain::Lsk,
        "10963c2aedbd64ee3ab1f104dafcdcd52e2b10496021f504286086e257ba04b2",
        6_500_000,
        1_529_998_200_000,
    ),
    (
        ChildChain::Neo,
        "e70f0b54d1ce4d0ba4e769e2ef69e93f49a23bf48f3cae67bfb6e1f42ef0a9c6",
        2_420_000,
        1_529_998_300_000,
    ),
    (
        ChildChain::Wav,
        "3k8hwcQBVzmBA2tc2QxUxwZNYyHJRyYLiz9VyxJbd75etSQq1BCCDF8oPb5RC6dS",
        1_050_000,
        1_529_998_400_000,
    ),
];

static GENESIS_BLOCK: Lazy<ParentBlock> = Lazy::new(build_genesis);

fn build_genesis() -> ParentBlock {
    let mut headers = ChildHeaderMap::new();
    for (chain, hash, height, timestamp_ms) in GENESIS_CHILD_TIPS {
        headers.set_list(
            chain,
            vec![ChildHeader {
                chain,
                hash: hash.to_string(),
                previous_hash: blake2bl(&format!("{}-launch", chain)),
                timestamp_ms,
                height,
                merkle_root: blake2bl(hash),
                confirmations_in_parent: 1,
            }],
        );
    }

    let previous_hash = "0".repeat(64);
    let fingerprints_root = blake2bl(
        &GENESIS_CHILD_TIPS
            .iter()
            .map(|(_, hash, _, _)| *hash)
            .collect::<Vec<_>>()
            .join(""),
    );

    let mut items = headers.all_hashes();
    items.push(GENESIS_MINER.to_string());
    items.push(GENESIS_HEIGHT.to_string());
    items.push("1".to_string()); // version
    items.push("1".to_string()); // schema version
    items.push(GENESIS_NRG_GRANT.to_string());
    items.push(fingerprints_root.clone());
    let root = merkle_root(&items);

    let chain_root = blake2bl(&child_chain_root(&headers).to_str_radix(10));
    let hash = blake2bl(&format!("{}{}", previous_hash, root));

    ParentBlock {
        hash,
        previous_hash,
        version: 1,
        schema_version: 1,
        height: GENESIS_HEIGHT,
        miner: GENESIS_MINER.to_string(),
        difficulty: minimum_difficulty(),
        timestamp: GENESIS_TIMESTAMP,
        merkle_root: root,
        chain_root,
        distance: BigUint::from(1u8),
        total_distance: BigUint::from(1u8),
        nonce: "0".to_string(),
        nrg_grant: GENESIS_NRG_GRANT,
        emblem_weight: GENESIS_EMBLEM_WEIGHT,
        emblem_chain_address: GENESIS_EMBLEM_CHAIN_ADDRESS.to_string(),
        tx_fee_base: GENESIS_TX_FEE_BASE,
        tx_distance_sum_limit: GENESIS_TX_DISTANCE_SUM_LIMIT,
        tx_list: Vec::new(),
        tx_count: 0,
        blockchain_headers_count: 5,
        blockchain_headers: headers,
        blockchain_fingerprints_root: fingerprints_root,
    }
}

/// The canonical genesis block.
pub fn genesis_block() -> &'static ParentBlock {
    &GENESIS_BLOCK
}

/// Canonical genesis hash.
pub fn genesis_hash() -> &'static str {
    &GENESIS_BLOCK.hash
}

/// Verify the built genesis block against the canonical constant. Startup
/// must not proceed past a mismatch; it means the static genesis data or the
/// hashing layout changed underneath the network.
pub fn validate_genesis_hash() -> NodeResult<()> {
    let computed = genesis_hash();
    if computed != GENESIS_HASH {
        return Err(crate::errors::NodeError::Fatal(format!(
            "genesis hash mismatch: canonical {} computed {}",
            GENESIS_HASH, computed
        )));
    }
    Ok(())
}

/// Write genesis state into an empty store. A store that already carries a
/// latest block is left untouched.
pub fn bootstrap(store: &Store) -> NodeResult<bool> {
    if store.get::<ParentBlock>(keys::BLOCK_LATEST)?.is_some() {
        return Ok(false);
    }
    let genesis = genesis_block();
    store.put(&keys::block_at(GENESIS_HEIGHT), genesis)?;
    store.put(keys::BLOCK_LATEST, genesis)?;
    store.put(
        keys::ROVERS,
        &ChildChain::ALL
            .iter()
            .map(|c| c.to_string())
            .collect::<Vec<_>>(),
    )?;
    store.flush()?;
    tracing::info!(hash = %genesis.hash, "[GENESIS] wrote canonical height-1 block");
    Ok(true)
}
