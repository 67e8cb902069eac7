//! In-memory DAG of recently seen blocks across all branches.
//!
//! Blocks live in an arena keyed by hash and point at their parent by id, so
//! evicting a height is a plain map removal. Capacity is counted in distinct
//! block numbers, not blocks, so memory stays bounded however wide a fork is.

use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

use crate::block::{Block, BlockId, Hash, ZERO_HASH};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ForkCacheError {
    #[error("block {id} has number {got}, parent expects {expected}")]
    BadNumberBlock { id: BlockId, expected: u64, got: u64 },
    #[error("parent of block {0} is not cached")]
    UnlinkedBlock(BlockId),
    #[error("no common block reachable from {0}")]
    NonCommonBlock(BlockId),
}

#[derive(Debug, Clone)]
pub struct ForkBlock {
    pub block: Block,
    pub id: BlockId,
    /// Set only when the parent was cached at insertion time.
    pub parent: Option<Hash>,
}

/// The two divergent suffixes of a common-ancestor search, tip first.
/// Neither suffix contains `ancestor`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Branches {
    pub ancestor: BlockId,
    pub first: Vec<BlockId>,
    pub second: Vec<BlockId>,
}

#[derive(Debug, Default)]
struct Store {
    blocks: HashMap<Hash, ForkBlock>,
    by_num: BTreeMap<u64, Vec<Hash>>,
}

impl Store {
    fn insert(&mut self, fb: ForkBlock) {
        self.by_num.entry(fb.id.num).or_default().push(fb.id.hash);
        self.blocks.insert(fb.id.hash, fb);
    }

    fn remove(&mut self, hash: &Hash) -> Option<ForkBlock> {
        let fb = self.blocks.remove(hash)?;
        if let Some(siblings) = self.by_num.get_mut(&fb.id.num) {
            siblings.retain(|h| h != hash);
            if siblings.is_empty() {
                self.by_num.remove(&fb.id.num);
            }
        }
        Some(fb)
    }

    /// Drop every height below `floor` and, failing that, the lowest heights
    /// until at most `capacity` remain.
    fn evict(&mut self, floor: u64, capacity: usize) -> usize {
        let mut evicted = 0;
        loop {
            let lowest = match self.by_num.keys().next() {
                Some(n) => *n,
                None => break,
            };
            if lowest >= floor && self.by_num.len() <= capacity {
                break;
            }
            if let Some(hashes) = self.by_num.remove(&lowest) {
                for h in hashes {
                    self.blocks.remove(&h);
                    evicted += 1;
                }
            }
        }
        evicted
    }
}

#[derive(Debug)]
pub struct ForkCache {
    capacity: usize,
    linked: Store,
    unlinked: Store,
    head: Option<Hash>,
}

impl ForkCache {
    pub fn new(capacity: usize) -> Self {
        Self { capacity: capacity.max(1), linked: Store::default(), unlinked: Store::default(), head: None }
    }

    /// Insert `block`. Fails with [`ForkCacheError::UnlinkedBlock`] when the
    /// cache is non-empty and the parent is unknown; the block is then kept
    /// in the unlinked bucket.
    pub fn push(&mut self, block: Block) -> Result<BlockId, ForkCacheError> {
        let id = block.id();
        if self.linked.blocks.contains_key(&id.hash) {
            return Ok(self.head_id().unwrap_or(id));
        }
        let mut parent = None;
        if self.head.is_some() && block.header.parent != ZERO_HASH {
            match self.linked.blocks.get(&block.header.parent) {
                Some(p) => {
                    let expected = p.id.num.saturating_add(1);
                    if id.num != expected {
                        return Err(ForkCacheError::BadNumberBlock { id, expected, got: id.num });
                    }
                    parent = Some(p.id.hash);
                }
                None => {
                    if !self.unlinked.blocks.contains_key(&id.hash) {
                        self.unlinked.insert(ForkBlock { block, id, parent: None });
                        let floor = self.floor();
                        self.unlinked.evict(floor, self.capacity);
                    }
                    return Err(ForkCacheError::UnlinkedBlock(id));
                }
            }
        }
        self.unlinked.remove(&id.hash);
        self.linked.insert(ForkBlock { block, id, parent });
        if self.head_id().map_or(true, |h| id.num > h.num) {
            self.head = Some(id.hash);
        }
        let floor = self.floor();
        self.linked.evict(floor, self.capacity);
        self.unlinked.evict(floor, self.capacity);
        if let Some(h) = self.head {
            if !self.linked.blocks.contains_key(&h) {
                self.head = None;
            }
        }
        Ok(self.head_id().unwrap_or(id))
    }

    /// Lowest height that survives eviction.
    fn floor(&self) -> u64 {
        self.head_id()
            .map(|h| (h.num + 1).saturating_sub(self.capacity as u64))
            .unwrap_or(0)
    }

    pub fn head_id(&self) -> Option<BlockId> {
        self.head.and_then(|h| self.linked.blocks.get(&h)).map(|fb| fb.id)
    }

    pub fn head(&self) -> Option<&Block> {
        self.head.and_then(|h| self.linked.blocks.get(&h)).map(|fb| &fb.block)
    }

    /// Move `head` to its cached parent. False when there is none.
    pub fn pop(&mut self) -> bool {
        let parent = self
            .head
            .and_then(|h| self.linked.blocks.get(&h))
            .and_then(|fb| fb.parent)
            .filter(|p| self.linked.blocks.contains_key(p));
        match parent {
            Some(p) => {
                self.head = Some(p);
                true
            }
            None => false,
        }
    }

    pub fn set_head(&mut self, id: &BlockId) -> bool {
        if self.linked.blocks.contains_key(&id.hash) {
            self.head = Some(id.hash);
            true
        } else {
            false
        }
    }

    /// Remove one block. If it was the head, the head falls back to its parent.
    pub fn remove(&mut self, id: &BlockId) -> Option<Block> {
        let fb = self.linked.remove(&id.hash).or_else(|| self.unlinked.remove(&id.hash))?;
        if self.head == Some(id.hash) {
            self.head = fb.parent.filter(|p| self.linked.blocks.contains_key(p));
        }
        Some(fb.block)
    }

    pub fn get(&self, hash: &Hash) -> Option<&ForkBlock> {
        self.linked.blocks.get(hash)
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.linked.blocks.contains_key(hash)
    }

    pub fn contains_unlinked(&self, hash: &Hash) -> bool {
        self.unlinked.blocks.contains_key(hash)
    }

    pub fn len(&self) -> usize {
        self.linked.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.linked.blocks.is_empty()
    }

    pub fn unlinked_len(&self) -> usize {
        self.unlinked.blocks.len()
    }

    /// Distinct cached heights, ascending.
    pub fn heights(&self) -> Vec<u64> {
        self.linked.by_num.keys().copied().collect()
    }

    fn parent_of(&self, fb: &ForkBlock) -> Result<&ForkBlock, ForkCacheError> {
        fb.parent
            .and_then(|p| self.linked.blocks.get(&p))
            .ok_or(ForkCacheError::NonCommonBlock(fb.id))
    }

    /// Most recent common ancestor of `a` and `b`.
    pub fn find_common_ancestor(&self, a: &BlockId, b: &BlockId) -> Result<Branches, ForkCacheError> {
        let mut ka = self.linked.blocks.get(&a.hash).ok_or(ForkCacheError::NonCommonBlock(*a))?;
        let mut kb = self.linked.blocks.get(&b.hash).ok_or(ForkCacheError::NonCommonBlock(*b))?;
        let mut first = Vec::new();
        let mut second = Vec::new();

        while ka.id.num > kb.id.num {
            first.push(ka.id);
            ka = self.parent_of(ka)?;
        }
        while kb.id.num > ka.id.num {
            second.push(kb.id);
            kb = self.parent_of(kb)?;
        }
        while ka.id.hash != kb.id.hash {
            first.push(ka.id);
            second.push(kb.id);
            ka = self.parent_of(ka)?;
            kb = self.parent_of(kb)?;
        }
        Ok(Branches { ancestor: ka.id, first, second })
    }
}
