//! Parent-chain block model and validation rules.

use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::chains::{ChildChain, ChildHeaderMap};
use crate::errors::{NodeResult, ValidationError};
use crate::hashing::blake2bl;

/// Serde adapter: unbounded integers interchange as base-16 strings.
pub mod big_hex {
    use num_bigint::BigUint;
    use num_traits::Num;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &BigUint, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&v.to_str_radix(16))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<BigUint, D::Error> {
        let raw = String::deserialize(d)?;
        BigUint::from_str_radix(&raw, 16)
            .map_err(|e| de::Error::custom(format!("bad hex integer `{}`: {}", raw, e)))
    }
}

/// A block of the parent chain, bundling the latest rovered child headers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParentBlock {
    pub hash: String,
    pub previous_hash: String,
    pub version: u64,
    pub schema_version: u64,
    pub height: u64,
    pub miner: String,
    #[serde(with = "big_hex")]
    pub difficulty: BigUint,
    /// Unix seconds.
    pub timestamp: u64,
    pub merkle_root: String,
    pub chain_root: String,
    #[serde(with = "big_hex")]
    pub distance: BigUint,
    #[serde(with = "big_hex")]
    pub total_distance: BigUint,
    pub nonce: String,
    pub nrg_grant: u64,
    // Copied forward from genesis.
    pub emblem_weight: u64,
    pub emblem_chain_address: String,
    pub tx_fee_base: u64,
    pub tx_distance_sum_limit: u64,
    pub tx_list: Vec<String>,
    pub tx_count: u64,
    pub blockchain_headers_count: u64,
    pub blockchain_headers: ChildHeaderMap,
    pub blockchain_fingerprints_root: String,
}

impl ParentBlock {
    /// The full set of child block hashes referenced by this block. Two
    /// blocks with equal sets were assembled from the same rover context.
    pub fn header_hash_set(&self) -> BTreeSet<String> {
        self.blockchain_headers
            .iter_all()
            .map(|h| h.hash.clone())
            .collect()
    }

    /// Expected block hash from its own fields.
    pub fn expected_hash(&self) -> String {
        blake2bl(&format!("{}{}", self.previous_hash, self.merkle_root))
    }
}

/// A winning nonce reported by the mining worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Solution {
    pub nonce: String,
    #[serde(with = "big_hex")]
    pub distance: BigUint,
    /// Unix seconds at which the nonce was drawn.
    pub timestamp: u64,
    #[serde(with = "big_hex")]
    pub difficulty: BigUint,
    pub iterations: u64,
    pub time_diff_ms: u64,
}

/// Structural validation of a single block.
pub fn is_valid_block(block: &ParentBlock) -> NodeResult<()> {
    let expected = block.expected_hash();
    if block.hash != expected {
        return Err(ValidationError::HashMismatch {
            expected,
            actual: block.hash.clone(),
        }
        .into());
    }
    if block.height < 1 {
        return Err(ValidationError::InvalidHeight {
            expected: 1,
            actual: block.height,
        }
        .into());
    }
    for chain in ChildChain::ALL {
        let list = block.blockchain_headers.list(chain);
        if list.is_empty() {
            return Err(ValidationError::MissingChildHeaders(chain.to_string()).into());
        }
        if list.iter().any(|h| h.confirmations_in_parent < 1) {
            return Err(ValidationError::MissingChildHeaders(format!(
                "{} header with zero confirmations",
                chain
            ))
            .into());
        }
    }
    Ok(())
}

/// Validation of a block against its parent.
pub fn is_valid_child_of(block: &ParentBlock, parent: &ParentBlock) -> NodeResult<()> {
    is_valid_block(block)?;
    if block.height != parent.height + 1 {
        return Err(ValidationError::InvalidHeight {
            expected: parent.height + 1,
            actual: block.height,
        }
        .into());
    }
    if block.previous_hash != parent.hash {
        return Err(ValidationError::BrokenSequence(format!(
            "previous_hash {} does not reference parent {}",
            block.previous_hash, parent.hash
        ))
        .into());
    }
    if block.timestamp < parent.timestamp {
        return Err(ValidationError::TimestampRegression {
            actual: block.timestamp,
            parent: parent.timestamp,
        }
        .into());
    }
    let expected_total = &parent.total_distance + &block.distance;
    if block.total_distance != expected_total {
        return Err(ValidationError::TotalDistanceMismatch(format!(
            "expected {} got {}",
            expected_total.to_str_radix(16),
            block.total_distance.to_str_radix(16)
        ))
        .into());
    }
    Ok(())
}

/// Checks a chain of blocks ordered by ascending height: every element must
/// link to the one before it with non-decreasing time and weight.
pub fn validate_block_sequence(blocks: &[ParentBlock]) -> bool {
    blocks.windows(2).all(|pair| {
        let (parent, child) = (&pair[0], &pair[1]);
        child.previous_hash == parent.hash
            && child.height == parent.height + 1
            && child.timestamp >= parent.timestamp
            && child.total_distance >= parent.total_distance
    })
}
