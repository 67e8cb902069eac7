//! In-memory ledger implementing [`ChainDelegate`].
//!
//! Keeps the canonical chain as a height index, every accepted block on any
//! branch, and a [`ForkCache`] used to switch branches when a longer fork
//! shows up. No persistence and no contract execution.

use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::{debug, info, warn};

use crate::block::{Block, BlockId, Hash};
use crate::chain::{summary_heights, ChainDelegate, ChainError};
use crate::config;
use crate::fork_cache::{ForkCache, ForkCacheError};
use crate::inventory::{InvKind, Item};
use crate::message::Message;
use crate::now_ms;
use crate::transaction::Transaction;

const MAX_TX_PAYLOAD: usize = 256 * 1024;
const MAX_CONTRACT_PAYLOAD: usize = 64 * 1024;
const MAX_TX_LIFETIME_MS: u64 = 24 * 60 * 60 * 1000;
const MAX_TXS_PER_BLOCK: usize = 2_000;

struct ChainState {
    main: Vec<BlockId>,
    blocks: HashMap<Hash, Block>,
    fork_cache: ForkCache,
    pending: HashMap<Hash, Transaction>,
    /// Transaction id -> height of the main-chain block holding it.
    applied: HashMap<Hash, u64>,
}

impl ChainState {
    fn head(&self) -> BlockId {
        // main always holds at least genesis
        self.main.last().copied().unwrap_or_default()
    }

    fn in_main(&self, id: &BlockId) -> bool {
        usize::try_from(id.num)
            .ok()
            .and_then(|n| self.main.get(n))
            .map_or(false, |m| m.hash == id.hash)
    }

    fn main_at(&self, num: u64) -> Option<BlockId> {
        usize::try_from(num).ok().and_then(|n| self.main.get(n)).copied()
    }

    fn check_against_main(&self, block: &Block) -> Result<(), ChainError> {
        for tx in &block.transactions {
            if self.applied.contains_key(&tx.id()) {
                return Err(ChainError::BadBlock(format!("block {} repeats an applied transaction", block.id())));
            }
        }
        Ok(())
    }

    fn extend(&mut self, block: &Block) -> Vec<Hash> {
        let id = block.id();
        self.main.push(id);
        let mut ids = Vec::with_capacity(block.transactions.len());
        for tx in &block.transactions {
            let tx_id = tx.id();
            self.pending.remove(&tx_id);
            self.applied.insert(tx_id, id.num);
            ids.push(tx_id);
        }
        self.fork_cache.set_head(&id);
        ids
    }

    fn rewind_to(&mut self, num: u64) {
        while self.head().num > num {
            let Some(id) = self.main.pop() else { break };
            if let Some(block) = self.blocks.get(&id.hash) {
                for tx in &block.transactions {
                    let tx_id = tx.id();
                    self.applied.remove(&tx_id);
                    self.pending.insert(tx_id, tx.clone());
                }
            }
            self.fork_cache.pop();
        }
    }
}

pub struct MemoryChain {
    state: RwLock<ChainState>,
    genesis: Block,
    solidify_depth: u64,
}

impl MemoryChain {
    pub fn new(genesis: Block, cfg: &config::Chain) -> Self {
        let id = genesis.id();
        let mut fork_cache = ForkCache::new(cfg.fork_cache_capacity);
        // an empty cache takes any block as root
        let _ = fork_cache.push(genesis.clone());
        let mut blocks = HashMap::new();
        blocks.insert(id.hash, genesis.clone());
        Self {
            state: RwLock::new(ChainState {
                main: vec![id],
                blocks,
                fork_cache,
                pending: HashMap::new(),
                applied: HashMap::new(),
            }),
            genesis,
            solidify_depth: cfg.solidify_depth,
        }
    }

    fn solidified_in(&self, st: &ChainState) -> BlockId {
        let head = st.head();
        st.main_at(head.num.saturating_sub(self.solidify_depth)).unwrap_or(head)
    }

    pub fn head_block(&self) -> Block {
        let st = self.state.read();
        let head = st.head();
        st.blocks.get(&head.hash).cloned().unwrap_or_else(|| self.genesis.clone())
    }

    pub fn block_by_num(&self, num: u64) -> Option<Block> {
        let st = self.state.read();
        st.main_at(num).and_then(|id| st.blocks.get(&id.hash).cloned())
    }

    pub fn main_ids(&self) -> Vec<BlockId> {
        self.state.read().main.clone()
    }

    pub fn pending_len(&self) -> usize {
        self.state.read().pending.len()
    }

    pub fn fork_cache_heights(&self) -> Vec<u64> {
        self.state.read().fork_cache.heights()
    }

    /// Seal the pending pool into a new head block.
    pub fn produce_block(&self, timestamp_ms: u64, producer: [u8; 32]) -> Result<Block, ChainError> {
        let parent = self.head_block();
        let txs: Vec<Transaction> = {
            let st = self.state.read();
            st.pending
                .values()
                .filter(|tx| tx.expiration_ms >= timestamp_ms)
                .take(MAX_TXS_PER_BLOCK)
                .cloned()
                .collect()
        };
        let block = parent.child(timestamp_ms, producer, txs);
        self.apply_block(&block, false)?;
        Ok(block)
    }

    fn validate_shape(&self, block: &Block) -> Result<(), ChainError> {
        if !block.tx_root_matches() {
            return Err(ChainError::BadBlock(format!("tx root mismatch in {}", block.id())));
        }
        for tx in &block.transactions {
            if tx.expiration_ms < block.header.timestamp_ms {
                return Err(ChainError::BadBlock(format!("block {} carries an expired transaction", block.id())));
            }
        }
        Ok(())
    }

    fn switch_fork(&self, st: &mut ChainState, new_id: BlockId, old_head: BlockId) -> Result<Vec<Hash>, ChainError> {
        let branches = match st.fork_cache.find_common_ancestor(&new_id, &old_head) {
            Ok(b) => b,
            Err(_) => {
                st.fork_cache.set_head(&old_head);
                return Err(ChainError::NonCommonBlock(new_id));
            }
        };
        if branches.ancestor.num < self.solidified_in(st).num {
            st.fork_cache.set_head(&old_head);
            st.fork_cache.remove(&new_id);
            st.blocks.remove(&new_id.hash);
            return Err(ChainError::BadBlock(format!("fork at {} is below the solidified block", branches.ancestor)));
        }
        warn!(new = %new_id, old = %old_head, ancestor = %branches.ancestor, "switching fork");

        st.fork_cache.set_head(&old_head);
        st.rewind_to(branches.ancestor.num);

        let mut tx_ids = Vec::new();
        for (i, id) in branches.first.iter().rev().enumerate() {
            let Some(block) = st.blocks.get(&id.hash).cloned() else {
                return Err(ChainError::NonCommonBlock(*id));
            };
            if let Err(e) = st.check_against_main(&block) {
                // drop the bad block and everything built on it, then restore the old branch
                for bad in branches.first.iter().rev().skip(i) {
                    st.fork_cache.remove(bad);
                    st.blocks.remove(&bad.hash);
                }
                st.rewind_to(branches.ancestor.num);
                for old in branches.second.iter().rev() {
                    if let Some(b) = st.blocks.get(&old.hash).cloned() {
                        st.extend(&b);
                    }
                }
                st.fork_cache.set_head(&old_head);
                return Err(e);
            }
            tx_ids.extend(st.extend(&block));
        }
        info!(head = %new_id, "fork switch complete");
        Ok(tx_ids)
    }
}

impl ChainDelegate for MemoryChain {
    fn apply_block(&self, block: &Block, sync_mode: bool) -> Result<Vec<Hash>, ChainError> {
        let id = block.id();
        self.validate_shape(block)?;
        let mut st = self.state.write();
        if st.blocks.contains_key(&id.hash) {
            return Ok(Vec::new());
        }
        let head = st.head();
        if id.num <= self.solidified_in(&st).num && id.num > 0 {
            return Err(ChainError::BadBlock(format!("block {id} at or below the solidified height")));
        }
        match st.fork_cache.push(block.clone()) {
            Ok(_) => {}
            Err(ForkCacheError::UnlinkedBlock(_)) => return Err(ChainError::UnlinkedBlock(id)),
            Err(e @ ForkCacheError::BadNumberBlock { .. }) => return Err(ChainError::BadBlock(e.to_string())),
            Err(ForkCacheError::NonCommonBlock(_)) => return Err(ChainError::NonCommonBlock(id)),
        }
        st.blocks.insert(id.hash, block.clone());

        if block.header.parent == head.hash {
            if let Err(e) = st.check_against_main(block) {
                st.fork_cache.remove(&id);
                st.blocks.remove(&id.hash);
                return Err(e);
            }
            let txs = st.extend(block);
            debug!(block = %id, sync = sync_mode, "block applied");
            return Ok(txs);
        }
        if id.num <= head.num {
            st.fork_cache.set_head(&head);
            warn!(block = %id, head = %head, "received a fork block");
            return Ok(Vec::new());
        }
        self.switch_fork(&mut st, id, head)
    }

    fn apply_transaction(&self, tx: &Transaction) -> Result<bool, ChainError> {
        let id = tx.id();
        let now = now_ms();
        if tx.owner == [0u8; 32] {
            return Err(ChainError::BadTransaction("missing owner".into()));
        }
        if tx.payload.len() > MAX_TX_PAYLOAD {
            return Err(ChainError::BadTransaction(format!("payload of {} bytes", tx.payload.len())));
        }
        if tx.contract.invokes_vm() && tx.payload.len() > MAX_CONTRACT_PAYLOAD {
            return Err(ChainError::ResourceInsufficient("contract payload exceeds the energy limit".into()));
        }
        if tx.expiration_ms < now {
            return Err(ChainError::ExpiredTransaction);
        }
        if tx.expiration_ms > now + MAX_TX_LIFETIME_MS {
            return Err(ChainError::BadTransaction("expiration too far in the future".into()));
        }
        let mut st = self.state.write();
        if st.pending.contains_key(&id) || st.applied.contains_key(&id) {
            return Ok(false);
        }
        st.pending.insert(id, tx.clone());
        Ok(true)
    }

    fn missing_block_ids(&self, summary: &[BlockId], max: usize) -> Result<Vec<BlockId>, ChainError> {
        let st = self.state.read();
        let unforked = summary
            .iter()
            .rev()
            .find(|id| st.in_main(id))
            .copied()
            .ok_or_else(|| ChainError::SyncFailed("no summary entry on the main chain".into()))?;
        let end = st.head().num.min(unforked.num.saturating_add(max as u64));
        Ok((unforked.num..=end).filter_map(|n| st.main_at(n)).collect())
    }

    fn build_chain_summary(&self, tip: &BlockId, pending: &[BlockId]) -> Result<Vec<BlockId>, ChainError> {
        let st = self.state.read();
        let head = st.head();
        let low = self.solidified_in(&st).num;

        let (high_no_fork, fork) = if tip.num == 0 {
            (head.num, Vec::new())
        } else if st.in_main(tip) {
            (tip.num, Vec::new())
        } else {
            let branches = st
                .fork_cache
                .find_common_ancestor(tip, &head)
                .map_err(|_| ChainError::SyncFailed(format!("can't find block {tip}")))?;
            let mut fork = branches.first;
            fork.reverse();
            (branches.ancestor.num, fork)
        };
        if low > high_no_fork {
            return Err(ChainError::SyncFailed(format!("low {low} above unforked height {high_no_fork}")));
        }
        let high = high_no_fork + fork.len() as u64;
        let real_high = high + pending.len() as u64;

        let mut summary = Vec::new();
        for n in summary_heights(low, real_high) {
            let id = if n <= high_no_fork {
                st.main_at(n)
            } else if n <= high {
                fork.get((n - high_no_fork - 1) as usize).copied()
            } else {
                pending.get((n - high - 1) as usize).copied()
            };
            match id {
                Some(id) => summary.push(id),
                None => return Err(ChainError::SyncFailed(format!("no block at height {n}"))),
            }
        }
        Ok(summary)
    }

    fn fetch(&self, item: &Item) -> Result<Message, ChainError> {
        let st = self.state.read();
        match item.kind {
            InvKind::Block => st
                .blocks
                .get(&item.hash)
                .map(|b| Message::Block(b.clone()))
                .ok_or(ChainError::NotFound(*item)),
            InvKind::Transaction => {
                if let Some(tx) = st.pending.get(&item.hash) {
                    return Ok(Message::Transactions(vec![tx.clone()]));
                }
                st.applied
                    .get(&item.hash)
                    .and_then(|num| st.main_at(*num))
                    .and_then(|id| st.blocks.get(&id.hash))
                    .and_then(|b| b.transactions.iter().find(|tx| tx.id() == item.hash))
                    .map(|tx| Message::Transactions(vec![tx.clone()]))
                    .ok_or(ChainError::NotFound(*item))
            }
        }
    }

    fn head_id(&self) -> BlockId {
        self.state.read().head()
    }

    fn solidified_id(&self) -> BlockId {
        let st = self.state.read();
        self.solidified_in(&st)
    }

    fn genesis_block(&self) -> Block {
        self.genesis.clone()
    }

    fn contains_block(&self, id: &BlockId) -> bool {
        self.state.read().blocks.contains_key(&id.hash)
    }

    fn contains_in_main(&self, id: &BlockId) -> bool {
        self.state.read().in_main(id)
    }

    fn contains_transaction(&self, hash: &Hash) -> bool {
        let st = self.state.read();
        st.pending.contains_key(hash) || st.applied.contains_key(hash)
    }

    fn block_timestamp(&self, id: &BlockId) -> Option<u64> {
        self.state.read().blocks.get(&id.hash).map(|b| b.header.timestamp_ms)
    }
}
