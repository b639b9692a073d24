//! Engine coordinator.
//!
//! Owns the multiverse, the block pool, the bus, and the mining worker
//! lifecycle. All state lives on one task: events arrive on an unbounded
//! queue and are processed strictly in order, so persistence writes and bus
//! reactions can never interleave.

use std::collections::{BTreeMap, BTreeSet};
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use tokio::sync::{mpsc, oneshot};

use crate::block::{is_valid_child_of, ParentBlock, Solution};
use crate::chains::{ChildChain, ChildHeader};
use crate::clock::Clock;
use crate::config;
use crate::errors::{NodeResult, PersistenceError};
use crate::mining::builder::{prepare_new_block, AssemblyContext};
use crate::mining::difficulty::minimum_difficulty;
use crate::mining::work::prepare_work;
use crate::mining::worker::{DifficultyData, WorkerHandle, WorkerJob};
use crate::multiverse::Multiverse;
use crate::pubsub::{
    BusMessage, PubSub, TOPIC_BLOCK_MINED, TOPIC_STATE_BLOCK_HEIGHT, TOPIC_STATE_CHECKPOINT_END,
    TOPIC_STATE_RESYNC_FAILED, TOPIC_UPDATE_BLOCK_LATEST, TOPIC_UPDATE_CHECKPOINT_START,
};
use crate::rpc::{broadcast_block, PeerConn, PeerQuery};
use crate::storage::{keys, Store};
use crate::blockpool::BlockPool;

const KNOWN_BLOCKS_CAP: usize = 1024;

/// How far below a dominating peer block the backward query reaches.
const SYNC_LOOKBACK: u64 = 7;

/// A candidate whose headers reference this many distinct child blocks is
/// stale and dropped before reassembly.
const STALE_CANDIDATE_HEADERS: usize = 6;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub miner_address: String,
    pub worker_enabled: bool,
    pub persist_rover_data: bool,
    pub p2p_passive: bool,
    pub gossip_peers: Vec<String>,
    pub public_url: String,
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self {
            miner_address: config::miner_address(),
            worker_enabled: !config::miner_disabled(),
            persist_rover_data: config::persist_rover_data(),
            p2p_passive: config::p2p_passive(),
            gossip_peers: config::gossip_peers(),
            public_url: format!("http://127.0.0.1:{}", config::port()),
        }
    }
}

/// Everything that can reach the engine task.
pub enum EngineEvent {
    RoverTip {
        header: ChildHeader,
    },
    PeerBlock {
        block: ParentBlock,
        peer: Arc<dyn PeerConn>,
    },
    WorkerSolution(Solution),
    WorkerExit {
        code: Option<i32>,
    },
    Bus {
        topic: String,
        msg: BusMessage,
    },
    MultiverseSnapshot {
        reply: oneshot::Sender<Vec<ParentBlock>>,
    },
    Shutdown,
}

pub struct Engine {
    store: Store,
    clock: Clock,
    cfg: EngineConfig,
    bus: PubSub,
    multiverse: Multiverse,
    pool: BlockPool,
    known_rovers: Vec<ChildChain>,
    can_mine: bool,
    peer_is_syncing: bool,
    peer_is_resyncing: bool,
    unfinished_block: Option<ParentBlock>,
    unfinished_block_data: Option<AssemblyContext>,
    worker: Option<WorkerHandle>,
    collected: BTreeMap<ChildChain, u64>,
    known_blocks: LruCache<String, ParentBlock>,
    events: mpsc::UnboundedSender<EngineEvent>,
}

impl Engine {
    /// Build an engine plus the sender/receiver pair of its event queue.
    /// The caller keeps the sender for producers and hands the receiver to
    /// `run`.
    pub fn new(
        store: Store,
        clock: Clock,
        cfg: EngineConfig,
    ) -> NodeResult<(
        Engine,
        mpsc::UnboundedSender<EngineEvent>,
        mpsc::UnboundedReceiver<EngineEvent>,
    )> {
        let (tx, rx) = mpsc::unbounded_channel();

        let mut bus = PubSub::new();
        for topic in [
            TOPIC_STATE_BLOCK_HEIGHT,
            TOPIC_UPDATE_BLOCK_LATEST,
            TOPIC_STATE_RESYNC_FAILED,
            TOPIC_STATE_CHECKPOINT_END,
        ] {
            let forward = tx.clone();
            bus.subscribe(topic, move |msg| {
                let _ = forward.send(EngineEvent::Bus {
                    topic: topic.to_string(),
                    msg: msg.clone(),
                });
            });
        }

        let known_rovers = store
            .get::<Vec<String>>(keys::ROVERS)?
            .map(|tags| {
                tags.iter()
                    .filter_map(|t| ChildChain::from_tag(t))
                    .collect::<Vec<_>>()
            })
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| ChildChain::ALL.to_vec());

        let mut multiverse = Multiverse::new();
        if let Some(latest) = store.get::<ParentBlock>(keys::BLOCK_LATEST)? {
            multiverse.add(latest, true);
        }

        let engine = Engine {
            store,
            clock,
            cfg,
            bus,
            multiverse,
            pool: BlockPool::new(),
            known_rovers,
            can_mine: false,
            peer_is_syncing: false,
            peer_is_resyncing: false,
            unfinished_block: None,
            unfinished_block_data: None,
            worker: None,
            collected: BTreeMap::new(),
            known_blocks: LruCache::new(
                NonZeroUsize::new(KNOWN_BLOCKS_CAP).expect("nonzero cache cap"),
            ),
            events: tx.clone(),
        };
        Ok((engine, tx, rx))
    }

    /// Consume the engine, processing events until the queue closes or a
    /// shutdown event arrives.
    pub async fn run(mut self, mut rx: mpsc::UnboundedReceiver<EngineEvent>) {
        while let Some(event) = rx.recv().await {
            if matches!(event, EngineEvent::Shutdown) {
                self.stop_mining();
                break;
            }
            if let Err(e) = self.handle(event).await {
                tracing::warn!(err = %e, "[ENGINE] event handling failed");
            }
        }
    }

    pub async fn handle(&mut self, event: EngineEvent) -> NodeResult<()> {
        match event {
            EngineEvent::RoverTip { header } => self.on_rover_tip(header),
            EngineEvent::PeerBlock { block, peer } => self.on_peer_block(peer, block).await,
            EngineEvent::WorkerSolution(solution) => self.on_worker_solution(solution),
            EngineEvent::WorkerExit { code } => self.on_worker_exit(code),
            EngineEvent::Bus { topic, msg } => self.on_pubsub(&topic, msg),
            EngineEvent::MultiverseSnapshot { reply } => {
                let _ = reply.send(self.multiverse.recent(7));
                Ok(())
            }
            EngineEvent::Shutdown => Ok(()),
        }
    }

    fn publish(&self, topic: &str, msg: &BusMessage) {
        self.bus.publish(topic, msg);
    }

    // -- read-only state, for status surfaces and tests --------------------

    pub fn can_mine(&self) -> bool {
        self.can_mine
    }

    pub fn is_syncing(&self) -> bool {
        self.peer_is_syncing
    }

    pub fn is_resyncing(&self) -> bool {
        self.peer_is_resyncing
    }

    /// The candidate currently assembled for mining, if any.
    pub fn candidate(&self) -> Option<&ParentBlock> {
        self.unfinished_block.as_ref()
    }

    pub fn tip(&self) -> Option<ParentBlock> {
        self.multiverse.highest()
    }

    // -- rover intake -------------------------------------------------------

    pub fn on_rover_tip(&mut self, header: ChildHeader) -> NodeResult<()> {
        let chain = header.chain;
        *self.collected.entry(chain).or_insert(0) += 1;

        self.store.put(&keys::chain_latest(chain), &header)?;
        if self.cfg.persist_rover_data {
            self.store
                .put(&keys::chain_block_at(chain, header.height), &header)?;
        }

        if !self.can_mine
            && self
                .known_rovers
                .iter()
                .all(|c| self.collected.get(c).copied().unwrap_or(0) >= 1)
        {
            self.can_mine = true;
            tracing::info!("[ENGINE] all rovered chains reported, mining unlocked");
        }

        let active: BTreeSet<ChildChain> = self.collected.keys().copied().collect();
        let known: BTreeSet<ChildChain> = self.known_rovers.iter().copied().collect();
        if !self.can_mine || self.peer_is_syncing || active != known {
            return Ok(());
        }

        self.start_mining(&header)
    }

    // -- mining lifecycle ---------------------------------------------------

    pub fn start_mining(&mut self, trigger: &ChildHeader) -> NodeResult<()> {
        let tip_keys: Vec<String> = self
            .known_rovers
            .iter()
            .map(|c| keys::chain_latest(*c))
            .collect();
        let mut tips = Vec::with_capacity(tip_keys.len());
        for (chain, tip) in self
            .known_rovers
            .iter()
            .zip(self.store.get_many::<ChildHeader>(&tip_keys)?)
        {
            tips.push(tip.ok_or_else(|| {
                PersistenceError::MissingKey(keys::chain_latest(*chain))
            })?);
        }
        let latest: ParentBlock = self.store.get_required(keys::BLOCK_LATEST)?;

        if let Some(unfinished) = &self.unfinished_block {
            if unfinished.blockchain_headers.distinct_hash_count() >= STALE_CANDIDATE_HEADERS {
                tracing::debug!("[ENGINE] dropping stale candidate before reassembly");
                self.unfinished_block = None;
                self.unfinished_block_data = None;
            }
        }

        let (candidate, final_ts) = prepare_new_block(
            self.clock.now_s(),
            &latest,
            &tips,
            trigger,
            Vec::new(),
            &self.cfg.miner_address,
            self.unfinished_block.as_ref(),
        )?;
        let work = prepare_work(&latest.hash, &candidate.blockchain_headers);

        let new_headers: Vec<ChildHeader> = self
            .known_rovers
            .iter()
            .filter_map(|&c| {
                let now = candidate.blockchain_headers.latest(c)?;
                let was = latest.blockchain_headers.latest(c)?;
                (now.hash != was.hash).then(|| now.clone())
            })
            .collect();

        self.unfinished_block = Some(candidate.clone());
        self.unfinished_block_data = Some(AssemblyContext {
            previous_block: latest.clone(),
            new_headers: new_headers.clone(),
            final_timestamp: final_ts,
            work: work.clone(),
        });

        if self.worker.is_some() {
            // Preempt; the next tip event reassembles and spawns fresh.
            self.restart_mining();
            return Ok(());
        }

        if !self.cfg.worker_enabled {
            tracing::debug!("[ENGINE] worker disabled, candidate assembled only");
            return Ok(());
        }

        let job = WorkerJob {
            current_timestamp: final_ts,
            offset_ms: self.clock.offset_ms(),
            work,
            miner_key: self.cfg.miner_address.clone(),
            merkle_root: candidate.merkle_root.clone(),
            difficulty: candidate.difficulty.clone(),
            difficulty_data: DifficultyData {
                current_timestamp: final_ts,
                previous_block: latest,
                new_headers,
                minimum_difficulty: minimum_difficulty(),
            },
        };
        self.worker = Some(WorkerHandle::spawn(&job, self.events.clone())?);
        tracing::info!(
            height = candidate.height,
            difficulty = %candidate.difficulty,
            "[ENGINE] worker started"
        );
        Ok(())
    }

    /// Stop the current worker so the next event can spawn a fresh one.
    pub fn restart_mining(&mut self) {
        self.stop_mining();
    }

    /// Idempotent stop; true iff a worker was running.
    pub fn stop_mining(&mut self) -> bool {
        match self.worker.take() {
            Some(handle) => {
                handle.stop();
                true
            }
            None => false,
        }
    }

    fn on_worker_exit(&mut self, code: Option<i32>) -> NodeResult<()> {
        self.worker = None;
        match code {
            Some(0) => {
                // Natural end: either a solution already arrived or the
                // search timed out and the next tip will reassemble.
                tracing::debug!("[ENGINE] worker finished");
            }
            other => {
                tracing::warn!(code = ?other, "[ENGINE] worker crashed");
                self.unfinished_block = None;
                self.unfinished_block_data = None;
            }
        }
        Ok(())
    }

    pub fn on_worker_solution(&mut self, solution: Solution) -> NodeResult<()> {
        let (mut block, ctx) = match (self.unfinished_block.take(), self.unfinished_block_data.take())
        {
            (Some(b), Some(c)) => (b, c),
            _ => {
                tracing::info!("[ENGINE] late solution with no candidate, dropped");
                return Ok(());
            }
        };

        if solution.distance <= solution.difficulty {
            tracing::warn!("[ENGINE] solution below difficulty, dropped");
            return Ok(());
        }

        block.nonce = solution.nonce.clone();
        block.distance = solution.distance.clone();
        block.timestamp = solution.timestamp;
        block.difficulty = solution.difficulty.clone();
        block.total_distance = &ctx.previous_block.total_distance + &solution.distance;

        if let Err(e) = is_valid_child_of(&block, &ctx.previous_block) {
            tracing::warn!(err = %e, "[ENGINE] mined block failed validation, dropped");
            return Ok(());
        }

        if !self.process_mined_block(&block) {
            tracing::warn!(hash = %block.hash, "[ENGINE] mined block rejected by multiverse");
            return Ok(());
        }

        tracing::info!(
            height = block.height,
            hash = %block.hash,
            iterations = solution.iterations,
            time_diff_ms = solution.time_diff_ms,
            "[ENGINE] mined block integrated"
        );

        if !self.cfg.p2p_passive && !self.cfg.gossip_peers.is_empty() {
            let peers = self.cfg.gossip_peers.clone();
            let from = self.cfg.public_url.clone();
            let out = block.clone();
            tokio::spawn(async move {
                broadcast_block(peers, from, out).await;
            });
        }

        self.publish(
            TOPIC_UPDATE_BLOCK_LATEST,
            &BusMessage {
                key: Some(keys::block_at(block.height)),
                data: Some(block.clone()),
                ..Default::default()
            },
        );
        self.publish(TOPIC_BLOCK_MINED, &BusMessage::block(block));
        Ok(())
    }

    fn process_mined_block(&mut self, block: &ParentBlock) -> bool {
        self.known_blocks.put(block.hash.clone(), block.clone());
        self.multiverse.add(block.clone(), false)
    }

    // -- peer intake --------------------------------------------------------

    pub async fn on_peer_block(
        &mut self,
        peer: Arc<dyn PeerConn>,
        block: ParentBlock,
    ) -> NodeResult<()> {
        if self.known_blocks.contains(&block.hash) {
            return Ok(());
        }
        self.known_blocks.put(block.hash.clone(), block.clone());

        // While a checkpoint gap is open, anything below it is backward-sync
        // traffic and belongs to the pool, not the fork graph.
        let gap_ceiling = self.pool.checkpoint().map(|c| c.height);
        if gap_ceiling.map(|h| block.height < h).unwrap_or(false) {
            return self.pool.add(&self.store, &self.bus, block);
        }

        let before = self.multiverse.highest();
        let added = self.multiverse.add(block.clone(), false);
        let after = self.multiverse.highest();
        tracing::debug!(
            hash = %block.hash,
            height = block.height,
            added,
            "[ENGINE] peer block considered"
        );

        let before_hash = before.map(|b| b.hash);
        let after_hash = after.as_ref().map(|b| b.hash.clone());
        if before_hash != after_hash {
            // The tip moved: whatever we were mining is built on sand.
            self.stop_mining();
            self.publish(TOPIC_UPDATE_BLOCK_LATEST, &BusMessage::block(block));
            return Ok(());
        }

        let current = match after {
            Some(b) => b,
            None => return Ok(()),
        };
        if current.height < block.height && current.total_distance < block.total_distance {
            // A higher and heavier tip we cannot connect: sync backwards.
            self.publish(TOPIC_UPDATE_BLOCK_LATEST, &BusMessage::forced(block.clone()));
            self.stop_mining();
            self.backward_sync(peer, block).await?;
        }
        Ok(())
    }

    async fn backward_sync(
        &mut self,
        peer: Arc<dyn PeerConn>,
        block: ParentBlock,
    ) -> NodeResult<()> {
        self.peer_is_syncing = true;
        tracing::info!(
            peer = %peer.address(),
            target_height = block.height,
            "[SYNC] requesting backward range"
        );

        let request = PeerQuery {
            query_hash: block.hash.clone(),
            query_height: block.height,
            low: block.height.saturating_sub(SYNC_LOOKBACK).max(1),
            high: block.height.saturating_sub(1),
        };
        let mut response = match peer.query(request).await {
            Ok(blocks) => blocks,
            Err(e) => {
                tracing::warn!(err = %e, "[SYNC] peer query failed, treating as empty");
                Vec::new()
            }
        };
        response.sort_by(|a, b| b.height.cmp(&a.height));

        let mut candidate = Multiverse::selective();
        for b in response {
            candidate.add(b, true);
        }
        candidate.add(block, true);

        if candidate.total_block_count() > 6 {
            let dominated = match (candidate.highest(), self.multiverse.highest()) {
                (Some(theirs), Some(ours)) => {
                    theirs.total_distance > ours.total_distance && theirs.height > ours.height
                }
                (Some(_), None) => true,
                _ => false,
            };
            if dominated {
                if let Some(checkpoint) = candidate.lowest() {
                    tracing::info!(
                        checkpoint_height = checkpoint.height,
                        "[SYNC] adopting peer multiverse"
                    );
                    self.multiverse = candidate;
                    self.publish(
                        TOPIC_UPDATE_CHECKPOINT_START,
                        &BusMessage::block(checkpoint.clone()),
                    );
                    self.pool.purge(&self.store, checkpoint)?;
                }
            }
        }

        self.peer_is_syncing = false;
        Ok(())
    }

    // -- bus reactions ------------------------------------------------------

    pub fn on_pubsub(&mut self, topic: &str, msg: BusMessage) -> NodeResult<()> {
        match topic {
            TOPIC_STATE_BLOCK_HEIGHT => self.store_height(&msg),
            TOPIC_UPDATE_BLOCK_LATEST => self.update_latest_and_store(&msg),
            TOPIC_STATE_RESYNC_FAILED => {
                self.peer_is_resyncing = true;
                if let Some(checkpoint) = self.pool.checkpoint().cloned() {
                    self.pool.purge(&self.store, checkpoint)?;
                }
                Ok(())
            }
            TOPIC_STATE_CHECKPOINT_END => {
                self.peer_is_resyncing = false;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    pub fn store_height(&mut self, msg: &BusMessage) -> NodeResult<()> {
        let block = match &msg.data {
            Some(b) => b,
            None => return Ok(()),
        };
        if block.height < 2 {
            return Ok(());
        }
        if msg.force {
            self.store.put(&keys::block_at(block.height), block)?;
            return Ok(());
        }

        let parent: Option<ParentBlock> = self.store.get(&keys::block_at(block.height - 1))?;
        let connected = parent
            .map(|p| p.hash == block.previous_hash && p.total_distance < block.total_distance)
            .unwrap_or(false);
        if !connected {
            tracing::warn!(
                height = block.height,
                hash = %block.hash,
                "[ENGINE] storing orphan block at height"
            );
        }
        self.store.put(&keys::block_at(block.height), block)?;
        Ok(())
    }

    pub fn update_latest_and_store(&mut self, msg: &BusMessage) -> NodeResult<()> {
        let block = match &msg.data {
            Some(b) => b,
            None => return Ok(()),
        };

        let prev_latest: Option<ParentBlock> = match self.store.get(keys::BLOCK_LATEST) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(err = %e, "[ENGINE] latest read failed, best-effort update");
                None
            }
        };

        let extends = prev_latest
            .as_ref()
            .map(|p| p.hash == block.previous_hash)
            .unwrap_or(true);
        let fresh_enough = prev_latest
            .as_ref()
            .map(|p| block.timestamp >= p.timestamp)
            .unwrap_or(true);

        if (extends || msg.force) && fresh_enough {
            if let Err(e) = self
                .store
                .put(keys::BLOCK_LATEST, block)
                .and_then(|_| self.store.put(&keys::block_at(block.height), block))
            {
                tracing::warn!(err = %e, "[ENGINE] latest write failed");
            }
        }

        if msg.force {
            if let Some(multiverse) = &msg.multiverse {
                let mut drain = multiverse.clone();
                while let Some(b) = drain.pop() {
                    if let Err(e) = self.store.put(&keys::block_at(b.height), &b) {
                        tracing::warn!(height = b.height, err = %e, "[ENGINE] drain write failed");
                    }
                }
            }
            if let Some(purge) = msg.purge {
                if let Err(e) = self.pool.purge_from(&self.store, block.height, purge) {
                    tracing::warn!(err = %e, "[ENGINE] purge delegation failed");
                }
            }
        }
        Ok(())
    }

    // -- test access --------------------------------------------------------

    #[cfg(test)]
    fn bus_mut(&mut self) -> &mut PubSub {
        &mut self.bus
    }
}
