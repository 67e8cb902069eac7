use serde::{Deserialize, Serialize};
use std::fmt;

use crate::transaction::Transaction;

pub type Hash = [u8; 32];

pub const ZERO_HASH: Hash = [0u8; 32];

/// Block identity. The first 8 bytes of `hash` always carry `num` big-endian,
/// so a bare hash taken from an inventory still tells us the height.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct BlockId {
    pub num: u64,
    pub hash: Hash,
}

impl BlockId {
    pub fn new(num: u64, hash: Hash) -> Self {
        Self { num, hash }
    }

    /// Recover the id from a hash produced by [`Block::hash`].
    pub fn from_hash(hash: Hash) -> Self {
        let mut num = [0u8; 8];
        num.copy_from_slice(&hash[..8]);
        Self { num: u64::from_be_bytes(num), hash }
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.num, hex::encode(&self.hash[8..16]))
    }
}

impl fmt::Debug for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub num: u64,
    pub parent: Hash,
    pub timestamp_ms: u64,
    pub producer: [u8; 32],
    pub tx_root: Hash,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn new(num: u64, parent: Hash, timestamp_ms: u64, producer: [u8; 32], transactions: Vec<Transaction>) -> Self {
        let tx_root = Self::compute_tx_root(&transactions);
        Self {
            header: BlockHeader { num, parent, timestamp_ms, producer, tx_root },
            transactions,
        }
    }

    pub fn genesis(timestamp_ms: u64) -> Self {
        Self::new(0, ZERO_HASH, timestamp_ms, [0u8; 32], Vec::new())
    }

    /// Build the next block on top of `self`.
    pub fn child(&self, timestamp_ms: u64, producer: [u8; 32], transactions: Vec<Transaction>) -> Self {
        Self::new(self.header.num + 1, self.hash(), timestamp_ms, producer, transactions)
    }

    pub fn hash(&self) -> Hash {
        let h = &self.header;
        let mut hasher = blake3::Hasher::new();
        hasher.update(&h.num.to_le_bytes());
        hasher.update(&h.parent);
        hasher.update(&h.timestamp_ms.to_le_bytes());
        hasher.update(&h.producer);
        hasher.update(&h.tx_root);
        let mut out = *hasher.finalize().as_bytes();
        out[..8].copy_from_slice(&h.num.to_be_bytes());
        out
    }

    pub fn id(&self) -> BlockId {
        BlockId::new(self.header.num, self.hash())
    }

    pub fn num(&self) -> u64 {
        self.header.num
    }

    pub fn parent_id(&self) -> BlockId {
        BlockId::new(self.header.num.saturating_sub(1), self.header.parent)
    }

    pub fn compute_tx_root(transactions: &[Transaction]) -> Hash {
        let mut hasher = blake3::Hasher::new();
        for tx in transactions {
            hasher.update(&tx.id());
        }
        *hasher.finalize().as_bytes()
    }

    pub fn tx_root_matches(&self) -> bool {
        Self::compute_tx_root(&self.transactions) == self.header.tx_root
    }
}
