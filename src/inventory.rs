//! Inventory items and the global fetch queue.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use crate::block::{BlockId, Hash};
use crate::message::{Message, NodeId};
use crate::peer::PeerConnection;

/// Declaration order is fetch priority: blocks before transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum InvKind {
    Block,
    Transaction,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Item {
    pub hash: Hash,
    pub kind: InvKind,
}

impl Item {
    pub fn new(hash: Hash, kind: InvKind) -> Self {
        Self { hash, kind }
    }

    pub fn block(id: &BlockId) -> Self {
        Self::new(id.hash, InvKind::Block)
    }

    pub fn transaction(hash: Hash) -> Self {
        Self::new(hash, InvKind::Transaction)
    }
}

impl fmt::Debug for Item {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            InvKind::Block => write!(f, "block {}", BlockId::from_hash(self.hash)),
            InvKind::Transaction => write!(f, "tx {}", hex::encode(&self.hash[..8])),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PriorityFetchEntry {
    pub item: Item,
    pub seq: u64,
    pub refreshed_at: Instant,
}

/// What to do with an entry visited by [`FetchQueue::visit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visit {
    Keep,
    Remove,
}

/// Items advertised to us and not yet requested, one entry per item.
#[derive(Debug, Default)]
pub struct FetchQueue {
    order: BTreeMap<(InvKind, u64), Item>,
    entries: HashMap<Item, PriorityFetchEntry>,
    next_seq: u64,
}

impl FetchQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `item`, or refresh its timestamp when it is already queued.
    /// Returns true only for a new entry.
    pub fn push(&mut self, item: Item, now: Instant) -> bool {
        if let Some(entry) = self.entries.get_mut(&item) {
            entry.refreshed_at = now;
            return false;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.order.insert((item.kind, seq), item);
        self.entries.insert(item, PriorityFetchEntry { item, seq, refreshed_at: now });
        true
    }

    pub fn remove(&mut self, item: &Item) -> Option<PriorityFetchEntry> {
        let entry = self.entries.remove(item)?;
        self.order.remove(&(entry.item.kind, entry.seq));
        Some(entry)
    }

    pub fn contains(&self, item: &Item) -> bool {
        self.entries.contains_key(item)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in priority order.
    pub fn ordered(&self) -> Vec<PriorityFetchEntry> {
        self.order.values().filter_map(|item| self.entries.get(item).cloned()).collect()
    }

    /// Walk entries in priority order, removing those `f` rejects.
    pub fn visit<F>(&mut self, mut f: F)
    where
        F: FnMut(&PriorityFetchEntry) -> Visit,
    {
        let mut removed = Vec::new();
        for item in self.order.values() {
            if let Some(entry) = self.entries.get(item) {
                if f(entry) == Visit::Remove {
                    removed.push(*item);
                }
            }
        }
        for item in removed {
            self.remove(&item);
        }
    }
}

/// Per-peer batching of item hashes for one loop tick.
#[derive(Default)]
pub struct InvBatch {
    peers: HashMap<NodeId, (Arc<PeerConnection>, BTreeMap<InvKind, Vec<Hash>>)>,
}

impl InvBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, peer: &Arc<PeerConnection>, item: Item) {
        let (_, kinds) = self
            .peers
            .entry(peer.node_id())
            .or_insert_with(|| (peer.clone(), BTreeMap::new()));
        kinds.entry(item.kind).or_default().push(item.hash);
    }

    pub fn send_inventory(self) {
        self.send(|kind, ids| Message::Inventory { kind, ids });
    }

    pub fn send_fetch(self) {
        self.send(|kind, ids| Message::FetchInvData { kind, ids });
    }

    fn send<F>(self, build: F)
    where
        F: Fn(InvKind, Vec<Hash>) -> Message,
    {
        for (_, (peer, kinds)) in self.peers {
            for (kind, mut ids) in kinds {
                if kind == InvKind::Block {
                    // the embedded big-endian number makes byte order height order
                    ids.sort();
                }
                peer.queue_send(build(kind, ids));
            }
        }
    }
}
