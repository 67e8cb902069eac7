//! Outbound connection targets, peer reputation and pruning.

use lru::LruCache;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::cache::TtlMap;
use crate::config;
use crate::connection_manager::ConnectionManager;
use crate::message::DisconnectReason;
use crate::peer::{Direction, PeerConnection};

const DIAL_CACHE_SIZE: usize = 4096;
/// Candidates scoring below this are forgotten.
pub const SCORE_FLOOR: i32 = -200;

pub struct ConnectionPool {
    /// Candidate addresses and their reputation; the least recently
    /// touched one goes first when full.
    scores: Mutex<LruCache<SocketAddr, i32>>,
    dial_cache: Mutex<TtlMap<SocketAddr, ()>>,
    local: HashSet<SocketAddr>,
    max_active: usize,
    connect_factor: f64,
    active_factor: f64,
}

impl ConnectionPool {
    pub fn new(cfg: &config::P2p, local: impl IntoIterator<Item = SocketAddr>) -> Self {
        let capacity = NonZeroUsize::new(cfg.max_candidates).unwrap_or(NonZeroUsize::MIN);
        Self {
            scores: Mutex::new(LruCache::new(capacity)),
            dial_cache: Mutex::new(TtlMap::new(Duration::from_secs(cfg.dial_cache_secs), DIAL_CACHE_SIZE)),
            local: local.into_iter().collect(),
            max_active: cfg.max_active_peers,
            connect_factor: cfg.connect_factor,
            active_factor: cfg.active_factor,
        }
    }

    pub fn add_candidate(&self, addr: SocketAddr) {
        if self.local.contains(&addr) {
            return;
        }
        let mut scores = self.scores.lock();
        if !scores.contains(&addr) {
            scores.put(addr, 0);
        }
    }

    pub fn score(&self, addr: &SocketAddr) -> i32 {
        self.scores.lock().peek(addr).copied().unwrap_or(0)
    }

    pub fn is_candidate(&self, addr: &SocketAddr) -> bool {
        self.scores.lock().contains(addr)
    }

    pub fn candidates(&self) -> usize {
        self.scores.lock().len()
    }

    pub fn record_success(&self, addr: SocketAddr) {
        self.adjust(addr, 3);
    }

    pub fn record_failure(&self, addr: SocketAddr) {
        self.adjust(addr, -1);
    }

    /// Adjust reputation after a session ended with `reason`.
    pub fn record_disconnect(&self, addr: SocketAddr, reason: DisconnectReason) {
        let penalty = match reason {
            r if r.is_misbehaviour() => 100,
            DisconnectReason::Forked | DisconnectReason::IncompatibleChain | DisconnectReason::IncompatibleProtocol => 50,
            DisconnectReason::TimeOut | DisconnectReason::PingTimeout | DisconnectReason::FetchFail | DisconnectReason::SyncFail => 10,
            _ => 0,
        };
        if penalty > 0 {
            self.adjust(addr, -penalty);
        }
    }

    fn adjust(&self, addr: SocketAddr, delta: i32) {
        let mut scores = self.scores.lock();
        let score = scores.get(&addr).copied().unwrap_or(0).saturating_add(delta);
        if score < SCORE_FLOOR {
            scores.pop(&addr);
            debug!(%addr, score, "forgetting candidate");
        } else {
            scores.put(addr, score);
        }
    }

    fn lack(&self, active: usize, outbound: usize) -> usize {
        let by_total = ((self.max_active as f64 * self.connect_factor) as usize).saturating_sub(active);
        let by_outbound = ((self.max_active as f64 * self.active_factor) as usize).saturating_sub(outbound);
        by_total.max(by_outbound)
    }

    /// Addresses to dial this round, best reputation first. Each returned
    /// address is held in the dial cache so it is not retried too soon.
    pub fn fill_up(&self, manager: &ConnectionManager) -> Vec<SocketAddr> {
        let active = manager.active_peers();
        let outbound = active.iter().filter(|p| p.direction() == Direction::Outbound).count();
        let lack = self.lack(active.len(), outbound);
        if lack == 0 {
            return Vec::new();
        }
        let connected: HashSet<SocketAddr> =
            active.iter().flat_map(|p| [p.addr(), p.listen_addr()]).collect();

        let mut dial_cache = self.dial_cache.lock();
        let mut candidates: Vec<(SocketAddr, i32)> = self
            .scores
            .lock()
            .iter()
            .filter(|(addr, _)| !connected.contains(*addr) && !self.local.contains(*addr))
            .filter(|(addr, _)| !dial_cache.contains(*addr))
            .filter(|(addr, _)| {
                let ip = addr.ip();
                manager.is_trusted(&ip) || (!manager.is_bad(&ip) && !manager.is_recently_disconnected(&ip))
            })
            .map(|(addr, score)| (*addr, *score))
            .collect();
        candidates.sort_by(|a, b| b.1.cmp(&a.1));
        candidates.truncate(lack);
        for (addr, _) in &candidates {
            dial_cache.insert(*addr, ());
        }
        candidates.into_iter().map(|(addr, _)| addr).collect()
    }

    /// Whether another inbound connection fits next to the outbound reserve.
    pub fn is_can_connect(&self, manager: &ConnectionManager) -> bool {
        let inbound = manager.count(Direction::Inbound);
        (inbound as f64) < self.max_active as f64 * (1.0 - self.active_factor)
    }

    /// Peers to drop so the active set fits `max_active_peers`: worst
    /// reputation first, newest first among equals. Trusted peers are kept.
    pub fn prune(&self, manager: &ConnectionManager) -> Vec<Arc<PeerConnection>> {
        let active = manager.active_peers();
        let excess = active.len().saturating_sub(self.max_active);
        if excess == 0 {
            return Vec::new();
        }
        let mut ranked: Vec<(i32, Arc<PeerConnection>)> = active
            .into_iter()
            .filter(|p| !manager.is_trusted(&p.ip()))
            .map(|p| (self.score(&p.listen_addr()), p))
            .collect();
        ranked.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| b.1.connected_at().cmp(&a.1.connected_at())));
        ranked.into_iter().take(excess).map(|(_, p)| p).collect()
    }

    pub fn log_status(&self, manager: &ConnectionManager) {
        let peers = manager.active_peers();
        let outbound = peers.iter().filter(|p| p.direction() == Direction::Outbound).count();
        info!(
            active = peers.len(),
            outbound,
            inbound = peers.len() - outbound,
            candidates = self.candidates(),
            "peer pool status"
        );
        for p in &peers {
            let st = p.state();
            info!(
                peer = %p.node_id(),
                addr = %p.addr(),
                score = self.score(&p.listen_addr()),
                both_have = %st.block_both_have,
                remote_head = %st.remote_head,
                syncing = st.need_sync_from_peer(),
                need_sync_from_us = st.need_sync_from_us,
                to_fetch = st.sync_to_fetch.len(),
                requested = st.adv_requested.len() + st.sync_requested.len(),
                "peer"
            );
        }
    }
}
