//! The ledger as seen by the sync engine.

use thiserror::Error;

use crate::block::{Block, BlockId, Hash};
use crate::inventory::Item;
use crate::message::{DisconnectReason, Message};
use crate::transaction::Transaction;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainError {
    #[error("bad block: {0}")]
    BadBlock(String),
    #[error("unlinked block {0}")]
    UnlinkedBlock(BlockId),
    #[error("no common block with {0}")]
    NonCommonBlock(BlockId),
    #[error("bad transaction: {0}")]
    BadTransaction(String),
    #[error("duplicate transaction {}", hex::encode(&.0[..8]))]
    DuplicateTransaction(Hash),
    #[error("transaction expired")]
    ExpiredTransaction,
    #[error("insufficient resources: {0}")]
    ResourceInsufficient(String),
    #[error("{0:?} not found")]
    NotFound(Item),
    #[error("sync failed: {0}")]
    SyncFailed(String),
}

impl ChainError {
    /// Fork-shaped failures; the engine resyncs instead of punishing the peer.
    pub fn is_fork(&self) -> bool {
        matches!(self, ChainError::UnlinkedBlock(_) | ChainError::NonCommonBlock(_))
    }

    /// Reason to disconnect whoever supplied the offending data, if any.
    pub fn disconnect_reason(&self) -> Option<DisconnectReason> {
        match self {
            ChainError::BadBlock(_) => Some(DisconnectReason::BadBlock),
            ChainError::BadTransaction(_)
            | ChainError::ExpiredTransaction
            | ChainError::ResourceInsufficient(_) => Some(DisconnectReason::BadTransaction),
            ChainError::NotFound(_) => Some(DisconnectReason::FetchFail),
            ChainError::SyncFailed(_) => Some(DisconnectReason::SyncFail),
            ChainError::UnlinkedBlock(_) | ChainError::NonCommonBlock(_) | ChainError::DuplicateTransaction(_) => None,
        }
    }
}

pub trait ChainDelegate: Send + Sync {
    /// Validate and apply `block`, returning the ids of the transactions it carried.
    fn apply_block(&self, block: &Block, sync_mode: bool) -> Result<Vec<Hash>, ChainError>;

    /// Add `tx` to the pending pool. `Ok(false)` means it was already known.
    fn apply_transaction(&self, tx: &Transaction) -> Result<bool, ChainError>;

    /// Ids a peer with `summary` is missing: the newest summary entry on our
    /// main chain followed by at most `max` later ids.
    fn missing_block_ids(&self, summary: &[BlockId], max: usize) -> Result<Vec<BlockId>, ChainError>;

    /// Summary to send a peer whose last common block is `tip` and whose
    /// deque still holds `pending`.
    fn build_chain_summary(&self, tip: &BlockId, pending: &[BlockId]) -> Result<Vec<BlockId>, ChainError>;

    fn fetch(&self, item: &Item) -> Result<Message, ChainError>;

    fn head_id(&self) -> BlockId;
    fn solidified_id(&self) -> BlockId;
    fn genesis_block(&self) -> Block;

    fn genesis_id(&self) -> BlockId {
        self.genesis_block().id()
    }

    /// Known on any branch.
    fn contains_block(&self, id: &BlockId) -> bool;
    fn contains_in_main(&self, id: &BlockId) -> bool;
    fn contains_transaction(&self, hash: &Hash) -> bool;
    fn block_timestamp(&self, id: &BlockId) -> Option<u64>;
}

/// Heights sampled for a chain summary between `low` and `high`, both
/// included. The gap halves on every step, so the result is logarithmic in
/// `high - low` and densest near the tip.
pub fn summary_heights(low: u64, high: u64) -> Vec<u64> {
    let mut out = Vec::new();
    let mut n = low;
    while n <= high {
        out.push(n);
        n += (high - n + 2) / 2;
    }
    out
}
