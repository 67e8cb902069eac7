//! Per-peer session state.
//!
//! A [`PeerConnection`] is shared between the reader task, the writer task
//! and every engine loop. Mutable sync and gossip bookkeeping lives in one
//! `parking_lot` mutex; outbound messages go through an unbounded channel so
//! sending never blocks the caller.

use parking_lot::{Mutex, MutexGuard};
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use crate::block::BlockId;
use crate::cache::TtlMap;
use crate::inventory::{InvKind, Item};
use crate::message::{HelloMessage, Message, MessageKind, NodeId};
use crate::rate::WindowCounter;

const ADV_CACHE_TTL: Duration = Duration::from_secs(3600);
const ADV_CACHE_SIZE: usize = 100_000;
const FETCH_COUNTER_SPAN_SECS: usize = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Whether we are pulling the peer's chain. "Needs sync from peer" is
/// `Syncing`; there is no separate flag that could disagree with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Syncing,
    Completed,
}

/// Work for the per-connection writer task.
#[derive(Debug)]
pub enum Outbound {
    Message(Message),
    Close,
}

#[derive(Debug)]
struct RoundTrip {
    msg: Message,
    answer: MessageKind,
    sent_at: Instant,
    retries: u32,
}

#[derive(Debug, PartialEq, Eq)]
pub enum QueueCheck {
    Idle,
    Resend(Message),
    TimedOut(MessageKind),
}

/// Outstanding request/answer pairs, oldest first.
#[derive(Debug, Default)]
pub struct MessageQueue {
    pending: VecDeque<RoundTrip>,
}

impl MessageQueue {
    pub fn track(&mut self, msg: Message, now: Instant) {
        if let Some(answer) = msg.answer() {
            self.pending.push_back(RoundTrip { msg, answer, sent_at: now, retries: 0 });
        }
    }

    /// Clear the oldest round trip answered by `kind`. False when nothing waited for it.
    pub fn answer(&mut self, kind: MessageKind) -> bool {
        match self.pending.iter().position(|rt| rt.answer == kind) {
            Some(i) => {
                self.pending.remove(i);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn check(&mut self, now: Instant, timeout: Duration, max_retries: u32) -> QueueCheck {
        let Some(front) = self.pending.front_mut() else {
            return QueueCheck::Idle;
        };
        if now.duration_since(front.sent_at) <= timeout {
            return QueueCheck::Idle;
        }
        if front.retries < max_retries {
            front.retries += 1;
            front.sent_at = now;
            return QueueCheck::Resend(front.msg.clone());
        }
        QueueCheck::TimedOut(front.answer)
    }
}

#[derive(Debug)]
pub struct PeerState {
    /// Items the peer advertised to us.
    pub adv_received: TtlMap<Item, ()>,
    /// Items we advertised to the peer.
    pub adv_spread: TtlMap<Item, ()>,
    /// Items we asked the peer for and have not received.
    pub adv_requested: HashMap<Item, Instant>,

    pub sync_to_fetch: VecDeque<BlockId>,
    pub sync_requested: HashMap<BlockId, Instant>,
    pub sync_in_process: HashSet<BlockId>,
    pub chain_requested: Option<(Vec<BlockId>, Instant)>,

    pub block_both_have: BlockId,
    pub both_have_updated: Instant,
    /// Highest id we offered this peer in a chain inventory.
    pub last_sync_block_id: Option<BlockId>,
    pub remain_num: u64,
    pub phase: SyncPhase,
    pub need_sync_from_us: bool,
    pub remote_head: BlockId,
}

impl PeerState {
    fn new(genesis: BlockId, remote_head: BlockId) -> Self {
        Self {
            adv_received: TtlMap::new(ADV_CACHE_TTL, ADV_CACHE_SIZE),
            adv_spread: TtlMap::new(ADV_CACHE_TTL, ADV_CACHE_SIZE),
            adv_requested: HashMap::new(),
            sync_to_fetch: VecDeque::new(),
            sync_requested: HashMap::new(),
            sync_in_process: HashSet::new(),
            chain_requested: None,
            block_both_have: genesis,
            both_have_updated: Instant::now(),
            last_sync_block_id: None,
            remain_num: 0,
            phase: SyncPhase::Completed,
            need_sync_from_us: false,
            remote_head,
        }
    }

    pub fn need_sync_from_peer(&self) -> bool {
        self.phase == SyncPhase::Syncing
    }

    /// In any chain sync with this peer, either direction.
    pub fn in_sync(&self) -> bool {
        self.need_sync_from_peer() || self.need_sync_from_us
    }

    pub fn is_idle(&self) -> bool {
        self.adv_requested.is_empty() && self.sync_requested.is_empty() && self.chain_requested.is_none()
    }

    /// Advance "both have" to `id`. Older ids are ignored, so replays are harmless.
    pub fn advance_both_have(&mut self, id: BlockId) {
        if id.num >= self.block_both_have.num {
            self.block_both_have = id;
            self.both_have_updated = Instant::now();
        }
    }
}

pub struct PeerConnection {
    node_id: NodeId,
    addr: SocketAddr,
    direction: Direction,
    hello: HelloMessage,
    connected_at: Instant,
    state: Mutex<PeerState>,
    queue: Mutex<MessageQueue>,
    out_tx: mpsc::UnboundedSender<Outbound>,
    disconnected: AtomicBool,
    tx_fetches: WindowCounter,
}

impl PeerConnection {
    pub fn new(
        addr: SocketAddr,
        direction: Direction,
        hello: HelloMessage,
        genesis: BlockId,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Outbound>) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let peer = Arc::new(Self {
            node_id: hello.node_id,
            addr,
            direction,
            state: Mutex::new(PeerState::new(genesis, hello.head)),
            hello,
            connected_at: Instant::now(),
            queue: Mutex::new(MessageQueue::default()),
            out_tx,
            disconnected: AtomicBool::new(false),
            tx_fetches: WindowCounter::new(FETCH_COUNTER_SPAN_SECS),
        });
        (peer, out_rx)
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn ip(&self) -> IpAddr {
        self.addr.ip()
    }

    /// Address the peer accepts connections on, as announced in its hello.
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.addr.ip(), self.hello.listen_port)
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn hello(&self) -> &HelloMessage {
        &self.hello
    }

    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    pub fn state(&self) -> MutexGuard<'_, PeerState> {
        self.state.lock()
    }

    /// Hand `msg` to the writer task. Round trips are tracked for retry.
    pub fn queue_send(&self, msg: Message) {
        if self.is_disconnected() {
            return;
        }
        if msg.answer().is_some() {
            self.queue.lock().track(msg.clone(), Instant::now());
        }
        let _ = self.out_tx.send(Outbound::Message(msg));
    }

    /// Resend a round trip without tracking it again.
    pub(crate) fn resend(&self, msg: Message) {
        let _ = self.out_tx.send(Outbound::Message(msg));
    }

    pub(crate) fn close(&self) {
        let _ = self.out_tx.send(Outbound::Close);
    }

    /// A message of `kind` arrived; settle any round trip waiting for it.
    pub fn on_received(&self, kind: MessageKind) -> bool {
        self.queue.lock().answer(kind)
    }

    pub fn check_round_trips(&self, now: Instant, timeout: Duration, max_retries: u32) -> QueueCheck {
        self.queue.lock().check(now, timeout, max_retries)
    }

    pub fn pending_round_trips(&self) -> usize {
        self.queue.lock().len()
    }

    /// Record that we advertise `item` to this peer. False when the peer
    /// already has it, either way round.
    pub fn mark_advertised(&self, item: Item) -> bool {
        let mut st = self.state.lock();
        if st.adv_received.contains(&item) || st.adv_spread.contains(&item) {
            return false;
        }
        st.adv_spread.insert(item, ());
        true
    }

    /// Record an advertisement from this peer. A block also raises the
    /// remote head.
    pub fn mark_received(&self, item: Item) {
        let mut st = self.state.lock();
        st.adv_received.insert(item, ());
        if item.kind == InvKind::Block {
            let id = BlockId::from_hash(item.hash);
            if id.num > st.remote_head.num {
                st.remote_head = id;
            }
        }
    }

    /// Record a request for `item`. False when one is already outstanding.
    pub fn mark_requested(&self, item: Item, now: Instant) -> bool {
        let mut st = self.state.lock();
        if st.adv_requested.contains_key(&item) {
            return false;
        }
        st.adv_requested.insert(item, now);
        true
    }

    pub fn record_sync_cursor(&self, id: BlockId) {
        self.state.lock().advance_both_have(id);
    }

    pub fn tx_fetches(&self) -> &WindowCounter {
        &self.tx_fetches
    }

    /// Flag the session as gone. Only the first caller gets `true`.
    pub fn mark_disconnected(&self) -> bool {
        !self.disconnected.swap(true, Ordering::AcqRel)
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnection")
            .field("node_id", &self.node_id)
            .field("addr", &self.addr)
            .field("direction", &self.direction)
            .finish()
    }
}
