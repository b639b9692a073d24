//! Candidate assembly: turns the latest parent block plus the current child
//! tips into a mineable block.

use num_bigint::BigUint;

use crate::block::ParentBlock;
use crate::chains::{ChildChain, ChildHeader, ChildHeaderMap};
use crate::errors::{NodeResult, ValidationError};
use crate::hashing::blake2bl;
use crate::mining::difficulty::{get_diff, get_exp_factor_diff, minimum_difficulty, MAX_SAFE_DIFFICULTY};
use crate::mining::work::{child_chain_root, merkle_root};

/// Context captured when a candidate is assembled; needed to patch a worker
/// solution back in and to re-derive difficulty inside the worker.
#[derive(Debug, Clone)]
pub struct AssemblyContext {
    pub previous_block: ParentBlock,
    pub new_headers: Vec<ChildHeader>,
    pub final_timestamp: u64,
    pub work: String,
}

/// Advance the child header lists from the previous block to the current
/// tips. Unchanged tips are carried forward with one more confirmation; a
/// fresh tip enters at the front with one confirmation. Fresh tips already
/// captured by a preempted candidate are retained behind it.
fn advance_headers(
    previous: &ParentBlock,
    tips: &[ChildHeader],
    trigger: &ChildHeader,
    unfinished: Option<&ParentBlock>,
) -> NodeResult<(ChildHeaderMap, Vec<ChildHeader>)> {
    let mut next = ChildHeaderMap::new();
    let mut fresh = Vec::new();

    for chain in ChildChain::ALL {
        let tip = if trigger.chain == chain {
            trigger
        } else {
            tips.iter()
                .find(|t| t.chain == chain)
                .ok_or_else(|| ValidationError::MissingChildHeaders(chain.to_string()))?
        };
        let prev_list = previous.blockchain_headers.list(chain);
        let prev_first = prev_list
            .first()
            .ok_or_else(|| ValidationError::MissingChildHeaders(chain.to_string()))?;

        if tip.hash == prev_first.hash {
            next.set_list(chain, vec![prev_first.confirmed_again()]);
            continue;
        }

        let mut list = vec![ChildHeader {
            confirmations_in_parent: 1,
            ..tip.clone()
        }];
        // Keep earlier fresh tips an interrupted candidate already held.
        if let Some(pending) = unfinished {
            for held in pending.blockchain_headers.list(chain) {
                if held.hash != tip.hash && held.hash != prev_first.hash {
                    list.push(held.clone());
                }
            }
        }
        fresh.push(tip.clone());
        next.set_list(chain, list);
    }

    Ok((next, fresh))
}

fn block_merkle_items(
    headers: &ChildHeaderMap,
    miner: &str,
    height: u64,
    version: u64,
    schema_version: u64,
    nrg_grant: u64,
    fingerprints_root: &str,
) -> Vec<String> {
    let mut items = headers.all_hashes();
    items.push(miner.to_string());
    items.push(height.to_string());
    items.push(version.to_string());
    items.push(schema_version.to_string());
    items.push(nrg_grant.to_string());
    items.push(fingerprints_root.to_string());
    items
}

/// Assemble the next mining candidate on top of `previous`.
///
/// Returns the candidate (nonce empty, distance zero) and the timestamp it
/// settled on: the difficulty must narrow to 53 bits, and each retry moves
/// the timestamp one second later until it does.
pub fn prepare_new_block(
    now_s: u64,
    previous: &ParentBlock,
    tips: &[ChildHeader],
    trigger: &ChildHeader,
    tx_list: Vec<String>,
    miner: &str,
    unfinished: Option<&ParentBlock>,
) -> NodeResult<(ParentBlock, u64)> {
    let (headers, fresh) = advance_headers(previous, tips, trigger, unfinished)?;
    let new_block_count = fresh.len() as u64;
    let height = previous.height + 1;

    let min = minimum_difficulty();
    let ceiling = BigUint::from(MAX_SAFE_DIFFICULTY);
    let mut timestamp = now_s.max(previous.timestamp);
    let difficulty = loop {
        let pre = get_diff(
            timestamp * 1000,
            previous.timestamp * 1000,
            &previous.difficulty,
            &min,
            new_block_count,
        );
        let adjusted = get_exp_factor_diff(pre, previous.height);
        if adjusted <= ceiling {
            break adjusted;
        }
        timestamp += 1;
    };

    let fingerprints_root = blake2bl(&headers.all_hashes().join(""));
    let items = block_merkle_items(
        &headers,
        miner,
        height,
        previous.version,
        previous.schema_version,
        previous.nrg_grant,
        &fingerprints_root,
    );
    let root = merkle_root(&items);
    let chain_root = blake2bl(&child_chain_root(&headers).to_str_radix(10));
    let hash = blake2bl(&format!("{}{}", previous.hash, root));

    let tx_count = tx_list.len() as u64;
    let candidate = ParentBlock {
        hash,
        previous_hash: previous.hash.clone(),
        version: previous.version,
        schema_version: previous.schema_version,
        height,
        miner: miner.to_string(),
        difficulty,
        timestamp,
        merkle_root: root,
        chain_root,
        distance: BigUint::from(0u8),
        total_distance: previous.total_distance.clone(),
        nonce: String::new(),
        nrg_grant: previous.nrg_grant,
        emblem_weight: previous.emblem_weight,
        emblem_chain_address: previous.emblem_chain_address.clone(),
        tx_fee_base: previous.tx_fee_base,
        tx_distance_sum_limit: previous.tx_distance_sum_limit,
        tx_list,
        tx_count,
        blockchain_headers_count: headers.header_count(),
        blockchain_headers: headers,
        blockchain_fingerprints_root: fingerprints_root,
    };

    Ok((candidate, timestamp))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::genesis::genesis_block;

    fn current_tips(from: &ParentBlock, bump: Option<ChildChain>) -> Vec<ChildHeader> {
        ChildChain::ALL
            .iter()
            .map(|&chain| {
                let base = from.blockchain_headers.latest(chain).expect("tip").clone();
                if Some(chain) == bump {
                    ChildHeader {
                        hash: blake2bl(&format!("{}-next", chain)),
                        previous_hash: base.hash.clone(),
                        height: base.height + 1,
                        timestamp_ms: base.timestamp_ms + 600_000,
                        confirmations_in_parent: 1,
                        ..base
                    }
                } else {
                    base
                }
            })
            .collect()
    }

    #[test]
    fn candidate_extends_previous_block() {
        let genesis = genesis_block();
        let tips = current_tips(genesis, Some(ChildChain::Btc));
        let trigger = tips[0].clone();
        let (candidate, ts) = prepare_new_block(
            genesis.timestamp + 10,
            genesis,
            &tips,
            &trigger,
            Vec::new(),
            "0xminer",
            None,
        )
        .expect("assemble");

        assert_eq!(candidate.height, genesis.height + 1);
        assert_eq!(candidate.previous_hash, genesis.hash);
        assert_eq!(candidate.hash, candidate.expected_hash());
        assert_eq!(candidate.timestamp, ts);
        assert!(candidate.nonce.is_empty());
        assert_eq!(candidate.distance, BigUint::from(0u8));
        assert!(ts >= genesis.timestamp);
    }

    #[test]
    fn unchanged_tips_gain_confirmations() {
        let genesis = genesis_block();
        let tips = current_tips(genesis, Some(ChildChain::Eth));
        let trigger = tips[1].clone();
        let (candidate, _) = prepare_new_block(
            genesis.timestamp + 10,
            genesis,
            &tips,
            &trigger,
            Vec::new(),
            "0xminer",
            None,
        )
        .expect("assemble");

        let eth = candidate
            .blockchain_headers
            .latest(ChildChain::Eth)
            .expect("eth tip");
        assert_eq!(eth.confirmations_in_parent, 1, "fresh tip starts at one");

        let btc = candidate
            .blockchain_headers
            .latest(ChildChain::Btc)
            .expect("btc tip");
        assert_eq!(
            btc.confirmations_in_parent, 2,
            "carried tip gains a confirmation"
        );
    }

    #[test]
    fn preempted_fresh_tips_are_retained() {
        let genesis = genesis_block();
        let first_tips = current_tips(genesis, Some(ChildChain::Wav));
        let trigger = first_tips[4].clone();
        let (first_candidate, _) = prepare_new_block(
            genesis.timestamp + 5,
            genesis,
            &first_tips,
            &trigger,
            Vec::new(),
            "0xminer",
            None,
        )
        .expect("assemble first");

        // A second wav block arrives before the first candidate is solved.
        let mut second_tips = current_tips(genesis, None);
        let newer = ChildHeader {
            hash: blake2bl("wav-even-newer"),
            previous_hash: trigger.hash.clone(),
            height: trigger.height + 1,
            ..trigger.clone()
        };
        second_tips[4] = newer.clone();

        let (second_candidate, _) = prepare_new_block(
            genesis.timestamp + 11,
            genesis,
            &second_tips,
            &newer,
            Vec::new(),
            "0xminer",
            Some(&first_candidate),
        )
        .expect("assemble second");

        let wav = second_candidate.blockchain_headers.list(ChildChain::Wav);
        assert_eq!(wav.len(), 2, "old fresh tip rides along");
        assert_eq!(wav[0].hash, newer.hash, "newest tip leads the list");
        assert_eq!(wav[1].hash, trigger.hash);
    }

    #[test]
    fn difficulty_fits_53_bits() {
        let genesis = genesis_block();
        let tips = current_tips(genesis, Some(ChildChain::Neo));
        let trigger = tips[3].clone();
        let (candidate, _) = prepare_new_block(
            genesis.timestamp,
            genesis,
            &tips,
            &trigger,
            Vec::new(),
            "0xminer",
            None,
        )
        .expect("assemble");
        assert!(candidate.difficulty <= BigUint::from(MAX_SAFE_DIFFICULTY));
        assert!(candidate.difficulty >= minimum_difficulty());
    }
}
