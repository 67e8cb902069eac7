//! Chain sync: summary exchange, inventory intake, block fetch and the
//! ordered application of fetched blocks.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::block::{Block, BlockId};
use crate::cache::TtlMap;
use crate::engine::SyncEngine;
use crate::error::{P2pError, P2pResult};
use crate::inventory::InvKind;
use crate::message::{DisconnectReason, Message, NodeId};
use crate::now_ms;
use crate::peer::{PeerConnection, SyncPhase};

const RESERVATION_SIZE: usize = 100_000;

pub(crate) struct SyncState {
    /// Block ids some peer is fetching, so no two peers fetch the same block.
    requested: Mutex<TtlMap<BlockId, NodeId>>,
    /// Fetched blocks waiting until they head some peer's deque.
    waiting: Mutex<HashMap<BlockId, (Block, Arc<PeerConnection>)>>,
    fetch_flag: AtomicBool,
    handle_flag: AtomicBool,
    /// Serializes block application between the sync and gossip paths.
    pub(crate) block_lock: Mutex<()>,
}

impl SyncState {
    pub(crate) fn new(sync_timeout: Duration) -> Self {
        Self {
            requested: Mutex::new(TtlMap::new(sync_timeout, RESERVATION_SIZE)),
            waiting: Mutex::new(HashMap::new()),
            fetch_flag: AtomicBool::new(false),
            handle_flag: AtomicBool::new(false),
            block_lock: Mutex::new(()),
        }
    }
}

impl SyncEngine {
    /// Begin pulling `peer`'s chain from genesis. No-op while already syncing.
    pub fn start_sync(&self, peer: &Arc<PeerConnection>) {
        {
            let mut st = peer.state();
            if st.phase == SyncPhase::Syncing {
                debug!(peer = %peer.node_id(), "already syncing");
                return;
            }
            st.phase = SyncPhase::Syncing;
            st.sync_to_fetch.clear();
            st.remain_num = 0;
            st.block_both_have = self.chain.genesis_id();
            st.both_have_updated = Instant::now();
        }
        info!(peer = %peer.node_id(), head = %self.chain.head_id(), "start sync");
        self.sync_next(peer);
    }

    fn restart_sync(&self, peer: &Arc<PeerConnection>) {
        peer.state().phase = SyncPhase::Completed;
        self.start_sync(peer);
    }

    /// Send the next chain summary, unless one is still unanswered.
    pub fn sync_next(&self, peer: &Arc<PeerConnection>) {
        let (tip, pending) = {
            let st = peer.state();
            if st.chain_requested.is_some() {
                debug!(peer = %peer.node_id(), "chain request already pending");
                return;
            }
            (st.block_both_have, st.sync_to_fetch.iter().copied().collect::<Vec<_>>())
        };
        let summary = match self.chain.build_chain_summary(&tip, &pending) {
            Ok(summary) => summary,
            Err(e) => {
                warn!(peer = %peer.node_id(), error = %e, "could not build chain summary");
                self.disconnect(peer, DisconnectReason::SyncFail);
                return;
            }
        };
        {
            let mut st = peer.state();
            if st.chain_requested.is_some() {
                return;
            }
            st.chain_requested = Some((summary.clone(), Instant::now()));
        }
        debug!(
            peer = %peer.node_id(),
            first = ?summary.first(),
            last = ?summary.last(),
            len = summary.len(),
            "sending chain summary"
        );
        peer.queue_send(Message::SyncBlockChain(summary));
    }

    pub(crate) fn on_sync_block_chain(&self, peer: &Arc<PeerConnection>, summary: Vec<BlockId>) -> P2pResult<()> {
        let (first, last) = match (summary.first(), summary.last()) {
            (Some(f), Some(l)) => (*f, *l),
            _ => return Err(P2pError::bad_message("empty chain summary")),
        };
        if !self.chain.contains_in_main(&first) {
            return Err(P2pError::bad_message(format!("summary starts at {first}, not on our main chain")));
        }
        let head = self.chain.head_id();
        if first.num > head.num {
            return Err(P2pError::bad_message(format!("summary starts at {first}, above our head {head}")));
        }
        if let Some(offered) = peer.state().last_sync_block_id {
            if offered.num > last.num {
                return Err(P2pError::bad_message(format!("summary ends at {last}, below offered {offered}")));
            }
        }

        let ids = self
            .chain
            .missing_block_ids(&summary, self.cfg.sync.sync_fetch_batch)
            .unwrap_or_else(|e| {
                warn!(peer = %peer.node_id(), error = %e, "no common block with peer summary");
                Vec::new()
            });
        let Some(&offered) = ids.last() else {
            return Err(P2pError::new(DisconnectReason::IncompatibleChain, "no common block"));
        };
        let remain = {
            let mut st = peer.state();
            let remain = if ids.len() == 1 {
                st.need_sync_from_us = false;
                0
            } else {
                st.need_sync_from_us = true;
                head.num.saturating_sub(offered.num)
            };
            st.last_sync_block_id = Some(offered);
            remain
        };
        peer.queue_send(Message::ChainInventory { ids, remain });
        Ok(())
    }

    fn check_chain_inventory(&self, peer: &Arc<PeerConnection>, ids: &[BlockId], remain: u64) -> P2pResult<()> {
        let sent = peer
            .state()
            .chain_requested
            .as_ref()
            .map(|(summary, _)| summary.clone())
            .ok_or_else(|| P2pError::bad_message("chain inventory without a pending request"))?;
        let batch = self.cfg.sync.sync_fetch_batch;
        let Some(first) = ids.first() else {
            return Err(P2pError::bad_message("empty chain inventory"));
        };
        if ids.len() > batch + 1 {
            return Err(P2pError::bad_message(format!("chain inventory of {} ids", ids.len())));
        }
        if remain != 0 && ids.len() < batch {
            return Err(P2pError::bad_message(format!("{remain} remaining after a short batch of {}", ids.len())));
        }
        if ids.iter().enumerate().any(|(i, id)| first.num.checked_add(i as u64) != Some(id.num)) {
            return Err(P2pError::traitor("inventory ids are not continuous"));
        }
        if !sent.contains(first) && *first != self.chain.genesis_id() {
            return Err(P2pError::traitor(format!("inventory starts at {first}, not in our summary")));
        }

        let solid = self.chain.solidified_id();
        let solid_time = self.chain.block_timestamp(&solid).unwrap_or(0);
        let horizon_ms = self.cfg.sync.max_clock_drift_ms.saturating_add(now_ms()).saturating_sub(solid_time);
        let max_future = solid.num.saturating_add(horizon_ms / self.cfg.sync.block_interval_ms.max(1));
        let claimed = ids[ids.len() - 1].num.saturating_add(remain);
        if claimed > max_future {
            return Err(P2pError::traitor(format!("claims {claimed} blocks, clock allows {max_future}")));
        }
        Ok(())
    }

    pub(crate) fn on_chain_inventory(&self, peer: &Arc<PeerConnection>, ids: Vec<BlockId>, remain: u64) -> P2pResult<()> {
        self.check_chain_inventory(peer, &ids, remain)?;
        {
            let mut st = peer.state();
            st.chain_requested = None;
            st.phase = SyncPhase::Syncing;
        }
        if ids.len() == 1 && self.chain.contains_block(&ids[0]) {
            let mut st = peer.state();
            st.phase = SyncPhase::Completed;
            st.remain_num = 0;
            info!(peer = %peer.node_id(), head = %ids[0], "peer in sync");
            return Ok(());
        }

        let batch = self.cfg.sync.sync_fetch_batch;
        let fetch = {
            let _guard = self.sync.block_lock.lock();
            let mut st = peer.state();
            let anchor = ids[0];
            while let Some(back) = st.sync_to_fetch.back() {
                if *back == anchor {
                    break;
                }
                st.sync_to_fetch.pop_back();
            }
            st.remain_num = remain;
            st.sync_to_fetch.extend(ids.iter().skip(1).copied());
            while let Some(front) = st.sync_to_fetch.front().copied() {
                if !self.chain.contains_block(&front) {
                    break;
                }
                st.sync_to_fetch.pop_front();
                st.advance_both_have(front);
            }
            debug!(
                peer = %peer.node_id(),
                to_fetch = st.sync_to_fetch.len(),
                remain,
                "chain inventory accepted"
            );
            (remain == 0 && !st.sync_to_fetch.is_empty()) || (remain != 0 && st.sync_to_fetch.len() > batch)
        };
        if fetch {
            self.sync.fetch_flag.store(true, Ordering::Release);
        } else {
            self.sync_next(peer);
        }
        Ok(())
    }

    /// Request the next slice of every idle syncing peer's deque.
    pub fn fetch_sync_blocks(&self) {
        let peers: Vec<Arc<PeerConnection>> = self
            .manager
            .active_peers()
            .into_iter()
            .filter(|p| {
                let st = p.state();
                st.need_sync_from_peer() && st.is_idle()
            })
            .collect();
        if peers.is_empty() {
            return;
        }
        let waiting: HashSet<BlockId> = self.sync.waiting.lock().keys().copied().collect();
        let max = self.cfg.sync.max_block_fetch_per_peer;
        let now = Instant::now();
        let mut requested = self.sync.requested.lock();
        for peer in peers {
            let mut ids = Vec::new();
            {
                let mut st = peer.state();
                let st = &mut *st;
                for id in st.sync_to_fetch.iter() {
                    if requested.contains(id) || waiting.contains(id) {
                        continue;
                    }
                    requested.insert(*id, peer.node_id());
                    st.sync_requested.insert(*id, now);
                    ids.push(id.hash);
                    if ids.len() >= max {
                        break;
                    }
                }
            }
            if !ids.is_empty() {
                debug!(peer = %peer.node_id(), count = ids.len(), "fetching sync blocks");
                peer.queue_send(Message::FetchInvData { kind: InvKind::Block, ids });
            }
        }
    }

    pub(crate) fn on_sync_block(&self, peer: &Arc<PeerConnection>, block: Block) {
        self.sync.waiting.lock().entry(block.id()).or_insert_with(|| (block, peer.clone()));
        self.sync.handle_flag.store(true, Ordering::Release);
        let (idle, remain, queued) = {
            let st = peer.state();
            (st.is_idle(), st.remain_num, st.sync_to_fetch.len())
        };
        if idle {
            if remain > 0 && queued <= self.cfg.sync.sync_fetch_batch {
                self.sync_next(peer);
            } else {
                self.sync.fetch_flag.store(true, Ordering::Release);
            }
        }
    }

    /// Apply every waiting block that heads some peer's deque, repeating
    /// until a pass makes no progress.
    pub fn handle_sync_blocks(&self) {
        let _guard = self.sync.block_lock.lock();
        loop {
            let mut entries: Vec<(BlockId, Block, Arc<PeerConnection>)> = self
                .sync
                .waiting
                .lock()
                .iter()
                .map(|(id, (block, peer))| (*id, block.clone(), peer.clone()))
                .collect();
            if entries.is_empty() {
                break;
            }
            entries.sort_by_key(|(id, _, _)| *id);

            let mut progressed = false;
            for (id, block, supplier) in entries {
                if supplier.is_disconnected() {
                    self.sync.waiting.lock().remove(&id);
                    self.sync.requested.lock().remove(&id);
                    continue;
                }
                let mut found = false;
                for p in self.manager.active_peers() {
                    let mut st = p.state();
                    if st.sync_to_fetch.front() == Some(&id) {
                        st.sync_to_fetch.pop_front();
                        st.sync_in_process.insert(id);
                        found = true;
                    }
                }
                if found {
                    self.sync.waiting.lock().remove(&id);
                    progressed = true;
                    self.process_sync_block(&block);
                } else if self.chain.contains_block(&id) {
                    self.sync.waiting.lock().remove(&id);
                }
            }
            if !progressed {
                break;
            }
        }
    }

    fn process_sync_block(&self, block: &Block) {
        let id = block.id();
        let result = self.chain.apply_block(block, true);
        self.sync.requested.lock().remove(&id);
        match &result {
            Ok(_) => self.metrics.blocks_applied.inc(),
            Err(e) => warn!(block = %id, error = %e, "sync block rejected"),
        }
        for p in self.manager.active_peers() {
            let in_process = p.state().sync_in_process.remove(&id);
            if !in_process {
                continue;
            }
            match &result {
                Ok(_) => {
                    let drained = {
                        let mut st = p.state();
                        st.advance_both_have(id);
                        st.sync_to_fetch.is_empty()
                    };
                    if drained {
                        self.sync_next(&p);
                    }
                }
                Err(e) if e.is_fork() => {
                    warn!(peer = %p.node_id(), block = %id, "fork during sync, restarting");
                    self.restart_sync(&p);
                }
                Err(e) => {
                    let reason = e.disconnect_reason().unwrap_or(DisconnectReason::BadBlock);
                    self.disconnect(&p, reason);
                }
            }
        }
    }

    /// Run pending fetch and apply rounds. Driven by the sync loop.
    pub fn sync_tick(&self) {
        if self.sync.fetch_flag.swap(false, Ordering::AcqRel) {
            self.fetch_sync_blocks();
        }
        if self.sync.handle_flag.swap(false, Ordering::AcqRel) {
            self.handle_sync_blocks();
        }
    }

    pub fn sync_waiting_len(&self) -> usize {
        self.sync.waiting.lock().len()
    }

    pub(crate) fn release_sync_requests(&self, peer: &Arc<PeerConnection>) {
        let ids: Vec<BlockId> = {
            let mut st = peer.state();
            st.sync_in_process.clear();
            st.sync_requested.drain().map(|(id, _)| id).collect()
        };
        {
            let mut requested = self.sync.requested.lock();
            for id in ids {
                if requested.get(&id) == Some(&peer.node_id()) {
                    requested.remove(&id);
                }
            }
        }
        self.sync.waiting.lock().retain(|_, (_, supplier)| !Arc::ptr_eq(supplier, peer));
    }
}
