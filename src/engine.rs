//! The sync engine: peer lifecycle, message routing and the background loops.

use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::chain::ChainDelegate;
use crate::config::Config;
use crate::connection_manager::ConnectionManager;
use crate::dispatcher::{DispatchOutcome, TransactionDispatcher};
use crate::error::P2pError;
use crate::gossip::Gossip;
use crate::message::{DisconnectReason, HelloMessage, Message, NodeId, P2P_VERSION};
use crate::metrics::Metrics;
use crate::now_ms;
use crate::peer::{Direction, PeerConnection, QueueCheck, SyncPhase};
use crate::pool::ConnectionPool;
use crate::sync::SyncState;

pub struct SyncEngine {
    pub(crate) cfg: Config,
    pub(crate) chain: Arc<dyn ChainDelegate>,
    node_id: NodeId,
    pub(crate) manager: ConnectionManager,
    pub(crate) pool: ConnectionPool,
    pub(crate) dispatcher: Arc<TransactionDispatcher>,
    pub(crate) metrics: Arc<Metrics>,
    pub(crate) gossip: Gossip,
    pub(crate) sync: SyncState,
    outcomes: Mutex<Option<mpsc::UnboundedReceiver<DispatchOutcome>>>,
}

impl SyncEngine {
    /// Build the engine and start its transaction workers. The periodic
    /// loops start with [`SyncEngine::spawn`].
    pub fn new(
        cfg: Config,
        node_id: NodeId,
        chain: Arc<dyn ChainDelegate>,
        metrics: Arc<Metrics>,
        shutdown: &broadcast::Sender<()>,
    ) -> Arc<Self> {
        let (dispatcher, outcomes) = TransactionDispatcher::start(&cfg.dispatcher, chain.clone(), shutdown);
        let local = [format!("127.0.0.1:{}", cfg.net.listen_port), format!("{}:{}", cfg.net.listen_ip, cfg.net.listen_port)]
            .into_iter()
            .filter_map(|s| s.parse::<SocketAddr>().ok());
        Arc::new(Self {
            manager: ConnectionManager::new(&cfg.p2p),
            pool: ConnectionPool::new(&cfg.p2p, local),
            sync: SyncState::new(cfg.sync.sync_timeout()),
            gossip: Gossip::new(),
            dispatcher,
            metrics,
            chain,
            node_id,
            outcomes: Mutex::new(Some(outcomes)),
            cfg,
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn chain(&self) -> &Arc<dyn ChainDelegate> {
        &self.chain
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn dispatcher(&self) -> &Arc<TransactionDispatcher> {
        &self.dispatcher
    }

    pub fn local_hello(&self) -> HelloMessage {
        HelloMessage {
            version: P2P_VERSION,
            node_id: self.node_id,
            listen_port: self.cfg.net.listen_port,
            timestamp_ms: now_ms(),
            genesis: self.chain.genesis_id(),
            solidified: self.chain.solidified_id(),
            head: self.chain.head_id(),
        }
    }

    /// Validate the remote hello against our chain.
    pub fn check_hello(&self, hello: &HelloMessage) -> Result<(), DisconnectReason> {
        if hello.version != P2P_VERSION {
            return Err(DisconnectReason::IncompatibleProtocol);
        }
        if hello.node_id == self.node_id {
            return Err(DisconnectReason::DuplicatePeer);
        }
        if hello.genesis != self.chain.genesis_id() {
            return Err(DisconnectReason::IncompatibleChain);
        }
        let solid = self.chain.solidified_id();
        if hello.solidified.num <= solid.num && !self.chain.contains_in_main(&hello.solidified) {
            return Err(DisconnectReason::Forked);
        }
        Ok(())
    }

    /// Admit a handshaken peer and decide who syncs from whom.
    pub fn register_peer(&self, peer: &Arc<PeerConnection>) -> Result<(), DisconnectReason> {
        if peer.direction() == Direction::Inbound
            && !self.manager.is_trusted(&peer.ip())
            && !self.pool.is_can_connect(&self.manager)
        {
            return Err(DisconnectReason::TooManyPeers);
        }
        if let Some(replaced) = self.manager.process_peer(peer)? {
            self.disconnect(&replaced, DisconnectReason::DuplicatePeer);
        }
        if peer.direction() == Direction::Outbound {
            self.pool.record_success(peer.listen_addr());
        } else {
            self.pool.add_candidate(peer.listen_addr());
        }
        self.metrics.active_peers.set(self.manager.len() as i64);
        info!(peer = %peer.node_id(), addr = %peer.addr(), direction = ?peer.direction(), head = %peer.hello().head, "peer connected");
        self.on_peer_connected(peer);
        Ok(())
    }

    fn on_peer_connected(&self, peer: &Arc<PeerConnection>) {
        let head = self.chain.head_id();
        let remote = peer.hello().head;
        if remote.num > head.num {
            self.start_sync(peer);
            return;
        }
        let mut st = peer.state();
        if self.chain.contains_block(&remote) {
            st.advance_both_have(remote);
        }
        if remote.num == head.num {
            st.phase = SyncPhase::Completed;
            st.need_sync_from_us = false;
        } else {
            st.need_sync_from_us = true;
        }
    }

    /// Route one message from `peer`. Protocol violations disconnect it.
    pub fn on_message(&self, peer: &Arc<PeerConnection>, msg: Message) {
        if peer.is_disconnected() {
            return;
        }
        peer.on_received(msg.kind());
        let result = match msg {
            Message::Hello(_) => Err(P2pError::bad_message("hello after handshake")),
            Message::Ping(nonce) => {
                peer.queue_send(Message::Pong(nonce));
                Ok(())
            }
            Message::Pong(_) => Ok(()),
            Message::Disconnect(reason) => {
                info!(peer = %peer.node_id(), %reason, "peer disconnected us");
                self.close_session(peer, reason);
                Ok(())
            }
            Message::SyncBlockChain(summary) => self.on_sync_block_chain(peer, summary),
            Message::ChainInventory { ids, remain } => self.on_chain_inventory(peer, ids, remain),
            Message::Inventory { kind, ids } => self.on_inventory(peer, kind, ids),
            Message::FetchInvData { kind, ids } => self.on_fetch_inv_data(peer, kind, ids),
            Message::Block(block) => self.on_block(peer, block),
            Message::Transactions(txs) => self.on_transactions(peer, txs),
        };
        if let Err(e) = result {
            warn!(peer = %peer.node_id(), error = %e, "protocol violation");
            self.disconnect(peer, e.reason);
        }
    }

    /// Tell `peer` why, close the connection and release its state. Safe to
    /// call more than once.
    pub fn disconnect(&self, peer: &Arc<PeerConnection>, reason: DisconnectReason) {
        if !peer.mark_disconnected() {
            return;
        }
        info!(peer = %peer.node_id(), addr = %peer.addr(), %reason, "disconnecting peer");
        peer.resend(Message::Disconnect(reason));
        peer.close();
        self.cleanup(peer, reason);
    }

    /// The connection ended from the remote side or on an I/O error.
    pub fn close_session(&self, peer: &Arc<PeerConnection>, reason: DisconnectReason) {
        if !peer.mark_disconnected() {
            return;
        }
        debug!(peer = %peer.node_id(), %reason, "session closed");
        peer.close();
        self.cleanup(peer, DisconnectReason::Requested);
    }

    fn cleanup(&self, peer: &Arc<PeerConnection>, reason: DisconnectReason) {
        self.manager.process_disconnect(peer, reason);
        self.pool.record_disconnect(peer.listen_addr(), reason);
        self.release_sync_requests(peer);
        self.release_adv_requests(peer);
        self.metrics.disconnects.with_label_values(&[reason.as_str()]).inc();
        self.metrics.active_peers.set(self.manager.len() as i64);
    }

    /// Disconnect peers that stopped making progress or left requests unanswered.
    pub fn check_peers(&self) {
        let now = Instant::now();
        let block_update = self.cfg.sync.block_update_timeout();
        let adv_timeout = self.cfg.sync.adv_timeout();
        let sync_timeout = self.cfg.sync.sync_timeout();
        for peer in self.manager.active_peers() {
            let stalled = {
                let st = peer.state();
                if st.need_sync_from_peer() && now.duration_since(st.both_have_updated) > block_update {
                    Some("no sync progress")
                } else if st.adv_requested.values().any(|t| now.duration_since(*t) > adv_timeout) {
                    Some("inventory request timed out")
                } else if st.sync_requested.values().any(|t| now.duration_since(*t) > sync_timeout) {
                    Some("sync block request timed out")
                } else if st.chain_requested.as_ref().map_or(false, |(_, t)| now.duration_since(*t) > sync_timeout) {
                    Some("chain request timed out")
                } else {
                    None
                }
            };
            if let Some(why) = stalled {
                warn!(peer = %peer.node_id(), why, "peer stalled");
                self.disconnect(&peer, DisconnectReason::TimeOut);
            }
        }
        for peer in self.pool.prune(&self.manager) {
            self.disconnect(&peer, DisconnectReason::TooManyPeers);
        }
    }

    /// Resend or give up on unanswered round trips.
    pub fn check_round_trips(&self) {
        let now = Instant::now();
        let timeout = self.cfg.p2p.connection_timeout();
        for peer in self.manager.active_peers() {
            match peer.check_round_trips(now, timeout, self.cfg.p2p.max_retries) {
                QueueCheck::Idle => {}
                QueueCheck::Resend(msg) => {
                    debug!(peer = %peer.node_id(), kind = ?msg.kind(), "resending unanswered request");
                    peer.resend(msg);
                }
                QueueCheck::TimedOut(answer) => {
                    warn!(peer = %peer.node_id(), ?answer, "no answer after retries");
                    self.disconnect(&peer, DisconnectReason::PingTimeout);
                }
            }
        }
    }

    pub fn keepalive(&self) {
        for peer in self.manager.active_peers() {
            if peer.pending_round_trips() == 0 {
                peer.queue_send(Message::Ping(rand::random()));
            }
        }
    }

    /// Per-second upkeep of sliding windows and caches.
    pub fn decay(&self) {
        self.gossip.rotate();
        for peer in self.manager.active_peers() {
            peer.tx_fetches().rotate();
        }
    }

    pub fn update_gauges(&self) {
        self.metrics.active_peers.set(self.manager.len() as i64);
        self.metrics.fetch_queue.set(self.fetch_queue_len() as i64);
        self.metrics.spread_queue.set(self.spread_queue_len() as i64);
        self.metrics.dispatcher_backlog.set(self.dispatcher.backlog() as i64);
    }

    pub fn log_status(&self) {
        let head = self.chain.head_id();
        info!(
            head = %head,
            solidified = %self.chain.solidified_id(),
            fetch_queue = self.fetch_queue_len(),
            spread_queue = self.spread_queue_len(),
            sync_waiting = self.sync_waiting_len(),
            dispatcher = self.dispatcher.backlog(),
            "node status"
        );
        self.pool.log_status(&self.manager);
    }

    fn on_outcome(&self, outcome: DispatchOutcome) {
        match outcome {
            DispatchOutcome::Accepted { tx, .. } => {
                self.metrics.txs_applied.inc();
                self.broadcast_transaction(&tx);
            }
            DispatchOutcome::Rejected { peer, tx_id, error } => {
                debug!(peer = %peer.node_id(), tx = %hex::encode(&tx_id[..8]), %error, "transaction rejected");
                if let Some(reason) = error.disconnect_reason() {
                    self.disconnect(&peer, reason);
                }
            }
        }
    }

    /// Send `DISCONNECT(REQUESTED)` to every peer.
    pub fn shutdown_peers(&self) {
        for peer in self.manager.active_peers() {
            self.disconnect(&peer, DisconnectReason::Requested);
        }
    }

    /// Start the periodic loops. Each exits on the shutdown signal.
    pub fn spawn(self: &Arc<Self>, shutdown: &broadcast::Sender<()>) {
        let sync = &self.cfg.sync;
        self.spawn_ticker(shutdown, Duration::from_millis(sync.advertise_interval_ms), |e| e.advertise_tick());
        self.spawn_ticker(shutdown, Duration::from_millis(sync.fetch_interval_ms), |e| e.fetch_tick());
        self.spawn_ticker(shutdown, Duration::from_millis(sync.sync_interval_ms), |e| e.sync_tick());
        self.spawn_ticker(shutdown, Duration::from_millis(sync.check_interval_ms), |e| {
            e.check_peers();
            e.check_round_trips();
        });
        self.spawn_ticker(shutdown, Duration::from_secs(1), |e| {
            e.decay();
            e.update_gauges();
        });
        self.spawn_ticker(shutdown, Duration::from_secs(60), |e| e.gossip.purge());
        self.spawn_ticker(shutdown, Duration::from_secs(self.cfg.p2p.keepalive_interval_secs.max(1)), |e| e.keepalive());
        self.spawn_ticker(shutdown, Duration::from_secs(sync.status_interval_secs.max(1)), |e| e.log_status());

        if let Some(mut outcomes) = self.outcomes.lock().take() {
            let engine = self.clone();
            let mut shutdown_rx = shutdown.subscribe();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown_rx.recv() => break,
                        outcome = outcomes.recv() => match outcome {
                            Some(outcome) => engine.on_outcome(outcome),
                            None => break,
                        },
                    }
                }
            });
        }
    }

    fn spawn_ticker<F>(self: &Arc<Self>, shutdown: &broadcast::Sender<()>, period: Duration, mut f: F)
    where
        F: FnMut(&SyncEngine) + Send + 'static,
    {
        let engine = self.clone();
        let mut shutdown_rx = shutdown.subscribe();
        let period = period.max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut tick = interval(period);
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = tick.tick() => f(&engine),
                }
            }
        });
    }
}
