//! Advertise and fetch loops, plus the inventory, fetch and block handlers.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::block::{Block, BlockId, Hash};
use crate::cache::TtlMap;
use crate::engine::SyncEngine;
use crate::error::{P2pError, P2pResult};
use crate::inventory::{FetchQueue, InvBatch, InvKind, Item, Visit};
use crate::message::{DisconnectReason, Message};
use crate::now_ms;
use crate::peer::PeerConnection;
use crate::rate::WindowCounter;
use crate::transaction::Transaction;

const SEEN_TTL: Duration = Duration::from_secs(3600);
const SEEN_SIZE: usize = 100_000;
const RECENT_BLOCKS_TTL: Duration = Duration::from_secs(60);
const RECENT_BLOCKS_SIZE: usize = 10;
const RECENT_TXS_TTL: Duration = Duration::from_secs(3600);
const RECENT_TXS_SIZE: usize = 50_000;
const TX_COUNT_SPAN_SECS: usize = 60;

struct FetchState {
    queue: FetchQueue,
    /// Items ever queued, so a second advertiser does not cause a second fetch.
    seen: TtlMap<Item, ()>,
}

pub(crate) struct Gossip {
    fetch: Mutex<FetchState>,
    spread: Mutex<HashMap<Item, Instant>>,
    recent_blocks: Mutex<TtlMap<Hash, Block>>,
    recent_txs: Mutex<TtlMap<Hash, Transaction>>,
    /// Transactions this node advertised, for the fetch anti-flood check.
    tx_count: WindowCounter,
}

impl Gossip {
    pub(crate) fn new() -> Self {
        Self {
            fetch: Mutex::new(FetchState { queue: FetchQueue::new(), seen: TtlMap::new(SEEN_TTL, SEEN_SIZE) }),
            spread: Mutex::new(HashMap::new()),
            recent_blocks: Mutex::new(TtlMap::new(RECENT_BLOCKS_TTL, RECENT_BLOCKS_SIZE)),
            recent_txs: Mutex::new(TtlMap::new(RECENT_TXS_TTL, RECENT_TXS_SIZE)),
            tx_count: WindowCounter::new(TX_COUNT_SPAN_SECS),
        }
    }

    pub(crate) fn rotate(&self) {
        self.tx_count.rotate();
    }

    pub(crate) fn purge(&self) {
        self.fetch.lock().seen.purge();
        self.recent_blocks.lock().purge();
        self.recent_txs.lock().purge();
    }

    fn cached(&self, item: &Item) -> Option<Message> {
        match item.kind {
            InvKind::Block => self.recent_blocks.lock().get(&item.hash).cloned().map(Message::Block),
            InvKind::Transaction => self
                .recent_txs
                .lock()
                .get(&item.hash)
                .cloned()
                .map(|tx| Message::Transactions(vec![tx])),
        }
    }

    fn is_cached(&self, item: &Item) -> bool {
        match item.kind {
            InvKind::Block => self.recent_blocks.lock().contains(&item.hash),
            InvKind::Transaction => self.recent_txs.lock().contains(&item.hash),
        }
    }
}

impl SyncEngine {
    pub fn fetch_queue_len(&self) -> usize {
        self.gossip.fetch.lock().queue.len()
    }

    pub fn is_fetch_queued(&self, item: &Item) -> bool {
        self.gossip.fetch.lock().queue.contains(item)
    }

    pub fn spread_queue_len(&self) -> usize {
        self.gossip.spread.lock().len()
    }

    fn is_known(&self, item: &Item) -> bool {
        let known = match item.kind {
            InvKind::Block => self.chain.contains_block(&BlockId::from_hash(item.hash)),
            InvKind::Transaction => self.chain.contains_transaction(&item.hash),
        };
        known || self.gossip.is_cached(item)
    }

    /// Queue an advertised item for fetching. Returns true only when the
    /// item was new; a re-advertisement just refreshes the queued entry.
    pub fn add_inventory(&self, item: Item) -> bool {
        if self.is_known(&item) {
            return false;
        }
        {
            let now = Instant::now();
            let mut fetch = self.gossip.fetch.lock();
            if fetch.queue.contains(&item) {
                fetch.queue.push(item, now);
                return false;
            }
            if fetch.seen.contains(&item) {
                return false;
            }
            fetch.seen.insert(item, ());
            fetch.queue.push(item, now);
        }
        if item.kind == InvKind::Block {
            self.fetch_tick();
        }
        true
    }

    /// One pass of the fetch loop.
    pub fn fetch_tick(&self) {
        let peers = self.manager.active_peers();
        let window = self.cfg.sync.gossip_window();
        let max = self.cfg.sync.max_fetch_per_peer;
        let now = Instant::now();
        let mut batch = InvBatch::new();
        {
            let mut fetch = self.gossip.fetch.lock();
            let FetchState { queue, seen } = &mut *fetch;
            queue.visit(|entry| {
                if now.duration_since(entry.refreshed_at) > window {
                    debug!(item = ?entry.item, "too late to fetch");
                    seen.remove(&entry.item);
                    return Visit::Remove;
                }
                let chosen = peers
                    .iter()
                    .filter_map(|p| {
                        let st = p.state();
                        let load = st.adv_requested.len();
                        (st.adv_received.contains(&entry.item) && load < max).then_some((load, p))
                    })
                    .min_by_key(|(load, _)| *load)
                    .map(|(_, p)| p);
                match chosen {
                    Some(peer) => {
                        if peer.mark_requested(entry.item, now) {
                            batch.add(peer, entry.item);
                        }
                        Visit::Remove
                    }
                    None => Visit::Keep,
                }
            });
        }
        batch.send_fetch();
    }

    /// One pass of the advertise loop.
    pub fn advertise_tick(&self) {
        let peers: Vec<Arc<PeerConnection>> =
            self.manager.active_peers().into_iter().filter(|p| !p.state().in_sync()).collect();
        let block_interval = self.cfg.sync.block_interval();
        let now = Instant::now();
        let mut batch = InvBatch::new();
        {
            let mut spread = self.gossip.spread.lock();
            if spread.is_empty() || peers.is_empty() {
                return;
            }
            for (item, added) in spread.drain() {
                if item.kind == InvKind::Block && now.duration_since(added) > block_interval {
                    debug!(item = ?item, "block too old to advertise");
                    continue;
                }
                for peer in &peers {
                    if peer.mark_advertised(item) {
                        batch.add(peer, item);
                    }
                }
            }
        }
        batch.send_inventory();
    }

    pub fn broadcast_block(&self, block: &Block) {
        let id = block.id();
        {
            let mut spread = self.gossip.spread.lock();
            if spread.len() >= self.cfg.sync.max_spread_size {
                warn!(block = %id, "spread queue full, dropping block");
                return;
            }
            let mut recent_txs = self.gossip.recent_txs.lock();
            for tx in &block.transactions {
                let tx_id = tx.id();
                spread.remove(&Item::transaction(tx_id));
                recent_txs.insert(tx_id, tx.clone());
            }
            drop(recent_txs);
            self.gossip.recent_blocks.lock().insert(id.hash, block.clone());
            spread.insert(Item::block(&id), Instant::now());
        }
        info!(block = %id, "broadcasting block");
        self.advertise_tick();
    }

    pub fn broadcast_transaction(&self, tx: &Transaction) {
        let tx_id = tx.id();
        let mut spread = self.gossip.spread.lock();
        if spread.len() >= self.cfg.sync.max_spread_size {
            warn!(tx = %hex::encode(&tx_id[..8]), "spread queue full, dropping transaction");
            return;
        }
        self.gossip.tx_count.add(1);
        self.gossip.recent_txs.lock().insert(tx_id, tx.clone());
        spread.insert(Item::transaction(tx_id), Instant::now());
    }

    pub(crate) fn on_inventory(&self, peer: &Arc<PeerConnection>, kind: InvKind, ids: Vec<Hash>) -> P2pResult<()> {
        if ids.len() > self.cfg.sync.max_inventory_size {
            return Err(P2pError::bad_message(format!("inventory of {} items", ids.len())));
        }
        if kind == InvKind::Transaction {
            if peer.state().in_sync() {
                debug!(peer = %peer.node_id(), "dropping transaction inventory while syncing");
                return Ok(());
            }
            if self.dispatcher.is_busy() {
                warn!(peer = %peer.node_id(), backlog = self.dispatcher.backlog(), "dropping transaction inventory, dispatcher busy");
                return Ok(());
            }
        }
        for hash in ids {
            let item = Item::new(hash, kind);
            peer.mark_received(item);
            self.add_inventory(item);
        }
        Ok(())
    }

    pub(crate) fn on_fetch_inv_data(&self, peer: &Arc<PeerConnection>, kind: InvKind, ids: Vec<Hash>) -> P2pResult<()> {
        match kind {
            InvKind::Transaction => {
                {
                    let st = peer.state();
                    if let Some(hash) = ids.iter().find(|h| !st.adv_spread.contains(&Item::transaction(**h))) {
                        return Err(P2pError::bad_message(format!(
                            "fetch of transaction {} we never advertised",
                            hex::encode(&hash[..8])
                        )));
                    }
                }
                peer.tx_fetches().add(ids.len() as u64);
                let fetched = peer.tx_fetches().count(10);
                let spread = self.gossip.tx_count.count(60);
                if fetched > spread {
                    return Err(P2pError::bad_message(format!(
                        "fetched {fetched} transactions in 10s, node advertised {spread} in 60s"
                    )));
                }
            }
            InvKind::Block => {
                let st = peer.state();
                let advertised = ids.iter().all(|h| st.adv_spread.contains(&Item::new(*h, InvKind::Block)));
                if !advertised {
                    if !st.need_sync_from_us {
                        return Err(P2pError::bad_message("block fetch from a peer that needs no sync"));
                    }
                    if ids.len() > self.cfg.sync.max_block_fetch_per_peer {
                        return Err(P2pError::bad_message(format!("fetch of {} blocks", ids.len())));
                    }
                    let last = st.last_sync_block_id.map_or(0, |id| id.num);
                    let min = last.saturating_sub(2 * self.cfg.sync.sync_fetch_batch as u64);
                    for hash in &ids {
                        let num = BlockId::from_hash(*hash).num;
                        if num > last || num < min {
                            return Err(P2pError::bad_message(format!(
                                "fetch of block {num} outside offered range {min}..={last}"
                            )));
                        }
                    }
                }
            }
        }

        let frame_budget = self.cfg.p2p.max_frame_bytes / 2;
        let mut txs = Vec::new();
        let mut size = 0usize;
        for hash in ids {
            let item = Item::new(hash, kind);
            let msg = match self.gossip.cached(&item) {
                Some(msg) => msg,
                None => self
                    .chain
                    .fetch(&item)
                    .map_err(|e| P2pError::new(DisconnectReason::FetchFail, e.to_string()))?,
            };
            match msg {
                Message::Block(block) => {
                    peer.record_sync_cursor(block.id());
                    peer.queue_send(Message::Block(block));
                }
                Message::Transactions(found) => {
                    for tx in found {
                        size += bincode::serialized_size(&tx).unwrap_or(0) as usize;
                        txs.push(tx);
                    }
                    if size > frame_budget {
                        peer.queue_send(Message::Transactions(std::mem::take(&mut txs)));
                        size = 0;
                    }
                }
                other => warn!(kind = ?other.kind(), "unexpected message from fetch"),
            }
        }
        if !txs.is_empty() {
            peer.queue_send(Message::Transactions(txs));
        }
        Ok(())
    }

    pub(crate) fn on_block(&self, peer: &Arc<PeerConnection>, block: Block) -> P2pResult<()> {
        let id = block.id();
        let item = Item::block(&id);
        let (sync_requested, adv_requested) = {
            let st = peer.state();
            (st.sync_requested.contains_key(&id), st.adv_requested.contains_key(&item))
        };
        if !sync_requested && !adv_requested {
            return Err(P2pError::bad_message(format!("block {id} was not requested")));
        }
        if block.header.timestamp_ms >= now_ms() + self.cfg.sync.block_interval_ms {
            return Err(P2pError::bad_message(format!("block {id} timestamp is in the future")));
        }
        if sync_requested {
            peer.state().sync_requested.remove(&id);
            self.on_sync_block(peer, block);
            return Ok(());
        }
        peer.state().adv_requested.remove(&item);
        self.process_adv_block(peer, block)
    }

    fn process_adv_block(&self, peer: &Arc<PeerConnection>, block: Block) -> P2pResult<()> {
        let id = block.id();
        if !self.chain.contains_block(&block.parent_id()) {
            warn!(block = %id, peer = %peer.node_id(), head = %self.chain.head_id(), "unlinked block, starting sync");
            self.start_sync(peer);
            return Ok(());
        }
        let result = {
            let _guard = self.sync.block_lock.lock();
            self.chain.apply_block(&block, false)
        };
        match result {
            Ok(_) => {
                self.metrics.blocks_applied.inc();
                let item = Item::block(&id);
                for p in self.manager.active_peers() {
                    let advertised = p.state().adv_received.contains(&item);
                    if advertised {
                        p.record_sync_cursor(id);
                    }
                }
                self.broadcast_block(&block);
                Ok(())
            }
            Err(e) if e.is_fork() => {
                warn!(block = %id, error = %e, "fork block, starting sync");
                self.start_sync(peer);
                Ok(())
            }
            Err(e) => match e.disconnect_reason() {
                Some(reason) => Err(P2pError::new(reason, e.to_string())),
                None => Ok(()),
            },
        }
    }

    pub(crate) fn on_transactions(&self, peer: &Arc<PeerConnection>, txs: Vec<Transaction>) -> P2pResult<()> {
        {
            let mut st = peer.state();
            for tx in &txs {
                if st.adv_requested.remove(&Item::transaction(tx.id())).is_none() {
                    return Err(P2pError::bad_message(format!(
                        "transaction {} without request",
                        hex::encode(&tx.id()[..8])
                    )));
                }
            }
        }
        for tx in txs {
            if self.gossip.is_cached(&Item::transaction(tx.id())) {
                continue;
            }
            self.dispatcher.submit(peer, tx);
        }
        Ok(())
    }

    /// Give back what `peer` still owed us. Items another peer advertised
    /// go back in the queue; the rest are forgotten so a later
    /// advertisement can fetch them.
    pub(crate) fn release_adv_requests(&self, peer: &Arc<PeerConnection>) {
        let requested: Vec<Item> = peer.state().adv_requested.drain().map(|(item, _)| item).collect();
        if requested.is_empty() {
            return;
        }
        let others: Vec<Arc<PeerConnection>> = self
            .manager
            .active_peers()
            .into_iter()
            .filter(|p| !Arc::ptr_eq(p, peer))
            .collect();
        let now = Instant::now();
        {
            let mut fetch = self.gossip.fetch.lock();
            for item in requested {
                if others.iter().any(|p| p.state().adv_received.contains(&item)) {
                    fetch.queue.push(item, now);
                } else {
                    fetch.seen.remove(&item);
                }
            }
        }
        self.fetch_tick();
    }
}
