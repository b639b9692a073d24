//! In-memory fork graph of parent blocks, indexed by height.
//!
//! Each height holds its candidates sorted by total distance, heaviest
//! first. Fork choice assembles chains on demand; blocks are immutable and
//! identified by hash, so no parent pointers are kept.

use std::collections::BTreeMap;

use num_bigint::BigUint;

use crate::block::{validate_block_sequence, ParentBlock};

/// Chains this deep take part in regular fork choice; shallower containers
/// are treated as still syncing.
pub const FORK_CHOICE_DEPTH: usize = 7;

#[derive(Default)]
pub struct Multiverse {
    blocks: BTreeMap<u64, Vec<ParentBlock>>,
    /// When set, shallow containers are not treated as syncing.
    selective: bool,
}

impl Multiverse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn selective() -> Self {
        Self {
            blocks: BTreeMap::new(),
            selective: true,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn height_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn total_block_count(&self) -> usize {
        self.blocks.values().map(|v| v.len()).sum()
    }

    pub fn blocks_at(&self, height: u64) -> &[ParentBlock] {
        self.blocks.get(&height).map(|v| v.as_slice()).unwrap_or(&[])
    }

    fn sort_height(list: &mut Vec<ParentBlock>) {
        list.sort_by(|a, b| b.total_distance.cmp(&a.total_distance));
    }

    /// Insert a block. Returns true when the block was taken into the graph
    /// (either connected to an existing parent/child, forced, or accepted
    /// while the container is still shallow from a sync).
    pub fn add(&mut self, block: ParentBlock, force: bool) -> bool {
        let height = block.height;
        let header_set = block.header_hash_set();

        let has_parent = self
            .blocks
            .get(&height.wrapping_sub(1))
            .map(|list| {
                list.iter().any(|p| {
                    p.hash == block.previous_hash
                        && p.height + 1 == height
                        && p.header_hash_set() != header_set
                })
            })
            .unwrap_or(false);
        let has_child = self
            .blocks
            .get(&(height + 1))
            .map(|list| {
                list.iter().any(|c| {
                    c.previous_hash == block.hash
                        && c.height == height + 1
                        && c.header_hash_set() != header_set
                })
            })
            .unwrap_or(false);
        let already_present = self
            .blocks
            .get(&height)
            .map(|list| list.iter().any(|b| b.hash == block.hash))
            .unwrap_or(false);

        let syncing = self.blocks.len() < FORK_CHOICE_DEPTH && !self.selective;

        if has_parent || has_child {
            if !already_present {
                let list = self.blocks.entry(height).or_default();
                list.push(block);
                Self::sort_height(list);
            }
            return true;
        }

        if force || syncing {
            if !already_present {
                let list = self.blocks.entry(height).or_default();
                list.push(block);
                Self::sort_height(list);
            }
            return true;
        }

        false
    }

    /// Assemble every chain reachable by linking candidates downwards.
    /// Chains are returned youngest-first.
    fn assemble_chains(&self) -> Vec<Vec<&ParentBlock>> {
        let mut chains: Vec<Vec<&ParentBlock>> = Vec::new();
        for (_, list) in self.blocks.iter().rev() {
            for candidate in list {
                let mut extended = false;
                for chain in chains.iter_mut() {
                    let earliest = chain[chain.len() - 1];
                    if earliest.previous_hash == candidate.hash {
                        chain.push(candidate);
                        extended = true;
                    }
                }
                if !extended {
                    chains.push(vec![candidate]);
                }
            }
        }
        chains
    }

    fn chain_weight(chain: &[&ParentBlock]) -> BigUint {
        chain
            .iter()
            .fold(BigUint::from(0u8), |acc, b| acc + &b.total_distance)
    }

    fn chain_is_valid(chain: &[&ParentBlock]) -> bool {
        let ascending: Vec<ParentBlock> = chain.iter().rev().map(|b| (*b).clone()).collect();
        validate_block_sequence(&ascending)
    }

    /// Fork choice: among chains at least `depth` long that form a valid
    /// sequence, the one with the greatest summed total distance wins and its
    /// youngest block is the tip. With no eligible chain the heaviest chain
    /// of any length decides.
    pub fn highest_with_depth(&self, depth: usize) -> Option<ParentBlock> {
        let chains = self.assemble_chains();
        if chains.is_empty() {
            return None;
        }

        let eligible = chains
            .iter()
            .filter(|c| c.len() >= depth && Self::chain_is_valid(c))
            .max_by_key(|c| Self::chain_weight(c));
        if let Some(chain) = eligible {
            return Some((*chain[0]).clone());
        }

        chains
            .iter()
            .max_by_key(|c| Self::chain_weight(c))
            .map(|c| (*c[0]).clone())
    }

    pub fn highest(&self) -> Option<ParentBlock> {
        self.highest_with_depth(FORK_CHOICE_DEPTH)
    }

    /// The single block at the smallest populated height.
    pub fn lowest(&self) -> Option<ParentBlock> {
        self.blocks
            .values()
            .next()
            .and_then(|list| list.first())
            .cloned()
    }

    /// Up to `count` most recent blocks, one per height, youngest first.
    pub fn recent(&self, count: usize) -> Vec<ParentBlock> {
        self.blocks
            .iter()
            .rev()
            .take(count)
            .filter_map(|(_, list)| list.first().cloned())
            .collect()
    }

    /// Drop every block.
    pub fn purge(&mut self) {
        self.blocks.clear();
    }
}
