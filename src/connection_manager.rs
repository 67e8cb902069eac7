//! Admission control and the registry of active peers.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::cache::TtlMap;
use crate::config;
use crate::message::{DisconnectReason, NodeId};
use crate::peer::{Direction, PeerConnection};

const BAN_LIST_SIZE: usize = 10_000;

pub struct ConnectionManager {
    active: DashMap<NodeId, Arc<PeerConnection>>,
    bad_peers: Mutex<TtlMap<IpAddr, DisconnectReason>>,
    recently_disconnected: Mutex<TtlMap<IpAddr, ()>>,
    trusted: HashSet<IpAddr>,
    max_active: usize,
    max_per_ip: usize,
}

impl ConnectionManager {
    pub fn new(cfg: &config::P2p) -> Self {
        let trusted = cfg
            .trusted
            .iter()
            .filter_map(|s| match s.parse::<IpAddr>() {
                Ok(ip) => Some(ip),
                Err(e) => {
                    warn!(entry = %s, error = %e, "ignoring bad trusted address");
                    None
                }
            })
            .collect();
        Self {
            active: DashMap::new(),
            bad_peers: Mutex::new(TtlMap::new(Duration::from_secs(cfg.bad_peer_ban_secs), BAN_LIST_SIZE)),
            recently_disconnected: Mutex::new(TtlMap::new(
                Duration::from_secs(cfg.recent_disconnect_secs),
                BAN_LIST_SIZE,
            )),
            trusted,
            max_active: cfg.max_active_peers,
            max_per_ip: cfg.max_peers_per_ip,
        }
    }

    pub fn is_trusted(&self, ip: &IpAddr) -> bool {
        self.trusted.contains(ip)
    }

    pub fn is_bad(&self, ip: &IpAddr) -> bool {
        self.bad_peers.lock().contains(ip)
    }

    pub fn is_recently_disconnected(&self, ip: &IpAddr) -> bool {
        self.recently_disconnected.lock().contains(ip)
    }

    /// Early check on a fresh TCP connection, before any handshake.
    pub fn admit(&self, ip: IpAddr, direction: Direction) -> Result<(), DisconnectReason> {
        if self.is_trusted(&ip) {
            return Ok(());
        }
        if let Some(reason) = self.bad_peers.lock().get(&ip).copied() {
            return Err(reason);
        }
        if direction == Direction::Inbound && self.is_recently_disconnected(&ip) {
            return Err(DisconnectReason::RecentlyDisconnected);
        }
        Ok(())
    }

    /// Register a handshaken peer. A duplicate node id keeps whichever
    /// session started first; the later one is returned for disconnection
    /// when it is the already-registered session.
    pub fn process_peer(&self, peer: &Arc<PeerConnection>) -> Result<Option<Arc<PeerConnection>>, DisconnectReason> {
        let ip = peer.ip();
        if !self.is_trusted(&ip) {
            if let Some(reason) = self.bad_peers.lock().get(&ip).copied() {
                return Err(reason);
            }
            if peer.direction() == Direction::Inbound && self.active.len() >= self.max_active {
                return Err(DisconnectReason::TooManyPeers);
            }
            if self.connection_count(&ip) >= self.max_per_ip {
                return Err(DisconnectReason::TooManyPeersSameIp);
            }
        }

        match self.active.entry(peer.node_id()) {
            Entry::Occupied(mut slot) => {
                let existing = slot.get();
                if existing.connected_at() <= peer.connected_at() {
                    return Err(DisconnectReason::DuplicatePeer);
                }
                info!(peer = %existing.node_id(), addr = %existing.addr(), "dropping connection established later");
                Ok(Some(slot.insert(peer.clone())))
            }
            Entry::Vacant(slot) => {
                slot.insert(peer.clone());
                Ok(None)
            }
        }
    }

    /// Drop `peer` from the registry and remember why it left.
    pub fn process_disconnect(&self, peer: &Arc<PeerConnection>, reason: DisconnectReason) {
        self.active.remove_if(&peer.node_id(), |_, p| Arc::ptr_eq(p, peer));
        let ip = peer.ip();
        if self.is_trusted(&ip) {
            return;
        }
        if reason.is_misbehaviour() {
            self.bad_peers.lock().insert(ip, reason);
        } else {
            self.recently_disconnected.lock().insert(ip, ());
        }
    }

    pub fn connection_count(&self, ip: &IpAddr) -> usize {
        self.active.iter().filter(|e| e.value().ip() == *ip).count()
    }

    pub fn count(&self, direction: Direction) -> usize {
        self.active.iter().filter(|e| e.value().direction() == direction).count()
    }

    pub fn get(&self, node_id: &NodeId) -> Option<Arc<PeerConnection>> {
        self.active.get(node_id).map(|e| e.value().clone())
    }

    /// Snapshot of live peers.
    pub fn active_peers(&self) -> Vec<Arc<PeerConnection>> {
        self.active
            .iter()
            .map(|e| e.value().clone())
            .filter(|p| !p.is_disconnected())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    pub fn max_active(&self) -> usize {
        self.max_active
    }
}
