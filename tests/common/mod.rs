// Shared fixtures: an engine over an in-memory chain, and channel-backed
// peers whose outbound queue stands in for the wire.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

use stakenode::block::{Block, BlockId};
use stakenode::config::{self, Config};
use stakenode::memory_chain::MemoryChain;
use stakenode::message::{Message, NodeId};
use stakenode::metrics::Metrics;
use stakenode::peer::{Direction, Outbound, PeerConnection};
use stakenode::{ChainDelegate, SyncEngine};

pub struct Node {
    pub engine: Arc<SyncEngine>,
    pub chain: Arc<MemoryChain>,
    pub shutdown: broadcast::Sender<()>,
}

pub fn genesis() -> Block {
    Block::genesis(0)
}

pub fn new_chain() -> Arc<MemoryChain> {
    Arc::new(MemoryChain::new(genesis(), &config::Chain::default()))
}

/// Chain with `len` blocks on top of the shared genesis.
pub fn chain_with(len: usize, producer: u8) -> Arc<MemoryChain> {
    let chain = new_chain();
    let base = stakenode::now_ms().saturating_sub(len as u64 * 1_000);
    for i in 0..len {
        chain.produce_block(base + i as u64 * 1_000, [producer; 32]).expect("block produced");
    }
    chain
}

pub fn node_with(cfg: Config, chain: Arc<MemoryChain>) -> Node {
    let (shutdown, _) = broadcast::channel(1);
    let metrics = Arc::new(Metrics::new().expect("metrics registry"));
    let engine = SyncEngine::new(cfg, NodeId::random(), chain.clone(), metrics, &shutdown);
    Node { engine, chain, shutdown }
}

pub fn node(chain: Arc<MemoryChain>) -> Node {
    node_with(Config::default(), chain)
}

pub fn peer_addr(n: u8) -> SocketAddr {
    SocketAddr::from(([10, 0, 0, n], 18888))
}

/// A handshaken peer claiming `head`, not yet registered.
pub fn fake_peer(
    engine: &SyncEngine,
    n: u8,
    direction: Direction,
    head: BlockId,
) -> (Arc<PeerConnection>, mpsc::UnboundedReceiver<Outbound>) {
    let mut hello = engine.local_hello();
    hello.node_id = NodeId::random();
    hello.head = head;
    PeerConnection::new(peer_addr(n), direction, hello, engine.chain().genesis_id())
}

/// Register a fake outbound peer claiming `head`.
pub fn connect(engine: &SyncEngine, n: u8, head: BlockId) -> (Arc<PeerConnection>, mpsc::UnboundedReceiver<Outbound>) {
    let (peer, rx) = fake_peer(engine, n, Direction::Outbound, head);
    engine.register_peer(&peer).expect("peer admitted");
    (peer, rx)
}

/// Messages queued for the wire so far.
pub fn sent(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Vec<Message> {
    let mut out = Vec::new();
    while let Ok(o) = rx.try_recv() {
        if let Outbound::Message(msg) = o {
            out.push(msg);
        }
    }
    out
}

pub fn disconnect_reason(msgs: &[Message]) -> Option<stakenode::DisconnectReason> {
    msgs.iter().find_map(|m| match m {
        Message::Disconnect(reason) => Some(*reason),
        _ => None,
    })
}

/// Poll `check` until it holds or `limit` passes.
pub async fn eventually<F: FnMut() -> bool>(limit: Duration, mut check: F) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
