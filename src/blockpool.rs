//! Backward-sync buffer.
//!
//! While the gap between genesis and a checkpoint is being filled, peer
//! blocks arrive out of order. The pool persists whatever connects to the
//! frontier and caches the rest until it does.

use std::collections::HashMap;

use crate::block::ParentBlock;
use crate::errors::{NodeResult, ValidationError};
use crate::genesis::genesis_block;
use crate::pubsub::{BusMessage, PubSub, TOPIC_STATE_CHECKPOINT_END, TOPIC_STATE_RESYNC_FAILED};
use crate::storage::{keys, Store};

#[derive(Default)]
pub struct BlockPool {
    checkpoint: Option<ParentBlock>,
    cache: HashMap<String, ParentBlock>,
}

impl BlockPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn checkpoint(&self) -> Option<&ParentBlock> {
        self.checkpoint.as_ref()
    }

    fn earliest(&self, store: &Store) -> NodeResult<Option<ParentBlock>> {
        store.get(keys::BLOCK_EARLIEST)
    }

    fn write_frontier(&self, store: &Store, block: &ParentBlock) -> NodeResult<()> {
        store.put(&keys::block_at(block.height), block)?;
        store.put(keys::BLOCK_EARLIEST, block)?;
        Ok(())
    }

    /// Feed one backward-sync block into the pool.
    pub fn add(&mut self, store: &Store, bus: &PubSub, block: ParentBlock) -> NodeResult<()> {
        let checkpoint = self.checkpoint.clone().ok_or_else(|| {
            ValidationError::BrokenSequence("block pool has no checkpoint".to_string())
        })?;
        let genesis = genesis_block();
        let earliest = self.earliest(store)?.unwrap_or(checkpoint);

        if block.hash == genesis.hash || block.hash == earliest.hash {
            return Ok(());
        }

        if block.hash == earliest.previous_hash && block.previous_hash == genesis.hash {
            // The gap is closed.
            store.put(&keys::block_at(block.height), &block)?;
            store.delete(keys::BLOCK_EARLIEST)?;
            self.cache.clear();
            tracing::info!(height = block.height, "[POOL] backward sync complete");
            bus.publish(TOPIC_STATE_CHECKPOINT_END, &BusMessage::block(block));
            return Ok(());
        }

        if block.hash == earliest.previous_hash
            && block.height == 2
            && block.previous_hash != genesis.hash
        {
            // The chain bottoms out on something that is not our genesis.
            store.delete(keys::BLOCK_EARLIEST)?;
            self.cache.clear();
            tracing::warn!(
                previous_hash = %block.previous_hash,
                "[POOL] resync failed: height-2 block does not descend from genesis"
            );
            bus.publish(TOPIC_STATE_RESYNC_FAILED, &BusMessage::block(block));
            return Ok(());
        }

        if block.previous_hash != earliest.hash && earliest.previous_hash == block.hash {
            // Direct predecessor of the frontier.
            self.write_frontier(store, &block)?;
            self.drain_cache(store)?;
            return Ok(());
        }

        if block.height < earliest.height {
            // Out of order; hold it until the frontier reaches down to it.
            self.cache.insert(block.hash.clone(), block);
            self.drain_cache(store)?;
            return Ok(());
        }

        // At or above the frontier: persist it at its height and move the
        // frontier marker along.
        self.write_frontier(store, &block)?;
        Ok(())
    }

    /// Write every cached block that now connects to the frontier.
    fn drain_cache(&mut self, store: &Store) -> NodeResult<()> {
        loop {
            let earliest = match self.earliest(store)? {
                Some(e) => e,
                None => return Ok(()),
            };
            let next = self
                .cache
                .values()
                .find(|b| b.hash == earliest.previous_hash)
                .cloned();
            match next {
                Some(b) => {
                    self.cache.remove(&b.hash);
                    self.write_frontier(store, &b)?;
                }
                None => return Ok(()),
            }
        }
    }

    /// Install a checkpoint and clear the stale canonical range below it.
    pub fn purge(&mut self, store: &Store, checkpoint: ParentBlock) -> NodeResult<()> {
        let start = checkpoint.height.saturating_sub(1);
        self.checkpoint = Some(checkpoint);
        self.cache.clear();
        self.purge_from(store, start, 1)
    }

    /// Delete `bc.block.<i>` for `i` from `start` down to `end + 1`.
    /// Idempotent; deleting an absent key is a no-op.
    pub fn purge_from(&self, store: &Store, start: u64, end: u64) -> NodeResult<()> {
        let mut height = start;
        while height > end {
            store.delete(&keys::block_at(height))?;
            height -= 1;
        }
        Ok(())
    }
}
