// Connection lifecycle tests
// Admission, handshake checks, duplicate sessions, pruning and round trips.

mod common;

use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use common::*;
use stakenode::config::{self, Config};
use stakenode::connection_manager::ConnectionManager;
use stakenode::message::{HelloMessage, Message, MessageKind, NodeId, P2P_VERSION};
use stakenode::peer::{Direction, MessageQueue, Outbound, QueueCheck};
use stakenode::pool::ConnectionPool;
use stakenode::{ChainDelegate, DisconnectReason};

fn ip(n: u8) -> IpAddr {
    IpAddr::from([10, 0, 0, n])
}

#[test]
fn test_message_queue_retries_then_times_out() {
    let mut queue = MessageQueue::default();
    let start = Instant::now();
    queue.track(Message::Ping(7), start);
    queue.track(Message::Pong(7), start);
    assert_eq!(queue.len(), 1, "only round trips are tracked");

    let timeout = Duration::from_secs(20);
    assert_eq!(queue.check(start + Duration::from_secs(5), timeout, 1), QueueCheck::Idle);
    let later = start + Duration::from_secs(21);
    assert_eq!(queue.check(later, timeout, 1), QueueCheck::Resend(Message::Ping(7)));
    assert_eq!(queue.check(later + Duration::from_secs(21), timeout, 1), QueueCheck::TimedOut(MessageKind::Pong));

    assert!(queue.answer(MessageKind::Pong));
    assert!(!queue.answer(MessageKind::Pong));
    assert!(queue.is_empty());
}

#[tokio::test]
async fn test_misbehaving_ip_is_banned_and_others_only_delayed() {
    let node = node(new_chain());
    let m = node.engine.manager();
    assert_eq!(m.admit(ip(1), Direction::Inbound), Ok(()));

    let (a, _rx_a) = connect(&node.engine, 1, node.chain.head_id());
    let (b, _rx_b) = connect(&node.engine, 2, node.chain.head_id());
    node.engine.disconnect(&a, DisconnectReason::BadBlock);
    node.engine.disconnect(&b, DisconnectReason::TimeOut);

    assert_eq!(m.admit(ip(1), Direction::Inbound), Err(DisconnectReason::BadBlock));
    assert_eq!(m.admit(ip(1), Direction::Outbound), Err(DisconnectReason::BadBlock));
    assert_eq!(m.admit(ip(2), Direction::Inbound), Err(DisconnectReason::RecentlyDisconnected));
    assert_eq!(m.admit(ip(2), Direction::Outbound), Ok(()));
    assert!(m.is_empty());

    // the ban also covers a fresh session from the same address
    let (again, _rx) = fake_peer(&node.engine, 1, Direction::Outbound, node.chain.head_id());
    assert_eq!(node.engine.register_peer(&again), Err(DisconnectReason::BadBlock));
}

#[tokio::test]
async fn test_trusted_peers_bypass_admission() {
    let mut cfg = Config::default();
    cfg.p2p.trusted = vec!["10.0.0.1".into()];
    cfg.p2p.max_peers_per_ip = 1;
    let node = node_with(cfg, new_chain());

    let (a, _rx_a) = connect(&node.engine, 1, node.chain.head_id());
    node.engine.disconnect(&a, DisconnectReason::BadProtocol);
    assert_eq!(node.engine.manager().admit(ip(1), Direction::Inbound), Ok(()));

    // two sessions from one trusted ip
    let (_b, _rx_b) = connect(&node.engine, 1, node.chain.head_id());
    let (_c, _rx_c) = connect(&node.engine, 1, node.chain.head_id());
    assert_eq!(node.engine.manager().connection_count(&ip(1)), 2);
}

#[tokio::test]
async fn test_too_many_peers_from_one_ip() {
    let node = node(new_chain());
    let head = node.chain.head_id();
    let _first = connect(&node.engine, 1, head);
    let _second = connect(&node.engine, 1, head);

    let (third, _rx) = fake_peer(&node.engine, 1, Direction::Outbound, head);
    assert_eq!(node.engine.register_peer(&third), Err(DisconnectReason::TooManyPeersSameIp));
}

#[tokio::test]
async fn test_inbound_refused_when_full() {
    let mut cfg = Config::default();
    cfg.p2p.max_active_peers = 2;
    cfg.p2p.active_factor = 0.5;
    let node = node_with(cfg, new_chain());
    let head = node.chain.head_id();

    let (a, _rx_a) = fake_peer(&node.engine, 1, Direction::Inbound, head);
    node.engine.register_peer(&a).expect("room for one inbound");
    let (b, _rx_b) = fake_peer(&node.engine, 2, Direction::Inbound, head);
    assert_eq!(node.engine.register_peer(&b), Err(DisconnectReason::TooManyPeers));

    // outbound slots are reserved
    let _c = connect(&node.engine, 3, head);
    assert_eq!(node.engine.manager().len(), 2);
}

#[tokio::test]
async fn test_duplicate_node_keeps_earlier_session() {
    let node = node(new_chain());
    let head = node.chain.head_id();
    let (first, _rx_first) = connect(&node.engine, 1, head);

    let mut hello = first.hello().clone();
    hello.timestamp_ms += 1;
    let (second, _rx_second) = stakenode::PeerConnection::new(
        peer_addr(2),
        Direction::Inbound,
        hello,
        node.chain.genesis_id(),
    );
    assert_eq!(node.engine.register_peer(&second), Err(DisconnectReason::DuplicatePeer));
    let kept = node.engine.manager().get(&first.node_id()).expect("registered");
    assert!(std::sync::Arc::ptr_eq(&kept, &first));
}

#[tokio::test]
async fn test_disconnect_is_idempotent() {
    let node = node(new_chain());
    let (a, mut rx_a) = connect(&node.engine, 1, node.chain.head_id());
    assert_eq!(node.engine.manager().len(), 1);

    node.engine.disconnect(&a, DisconnectReason::Requested);
    node.engine.disconnect(&a, DisconnectReason::BadProtocol);
    node.engine.close_session(&a, DisconnectReason::Requested);

    let mut disconnects = 0;
    let mut closes = 0;
    while let Ok(out) = rx_a.try_recv() {
        match out {
            Outbound::Message(Message::Disconnect(reason)) => {
                assert_eq!(reason, DisconnectReason::Requested);
                disconnects += 1;
            }
            Outbound::Close => closes += 1,
            Outbound::Message(other) => panic!("unexpected {other:?}"),
        }
    }
    assert_eq!((disconnects, closes), (1, 1));
    assert!(node.engine.manager().is_empty());
    assert!(!node.engine.manager().is_bad(&a.ip()));

    // nothing is queued once the session is gone
    a.queue_send(Message::Ping(1));
    assert!(rx_a.try_recv().is_err());
}

#[tokio::test]
async fn test_hello_checks() {
    let node = node(chain_with(3, 1));
    let good = HelloMessage {
        node_id: NodeId::random(),
        ..node.engine.local_hello()
    };
    assert_eq!(node.engine.check_hello(&good), Ok(()));

    let old = HelloMessage { version: P2P_VERSION - 1, ..good.clone() };
    assert_eq!(node.engine.check_hello(&old), Err(DisconnectReason::IncompatibleProtocol));

    let me = HelloMessage { node_id: node.engine.node_id(), ..good.clone() };
    assert_eq!(node.engine.check_hello(&me), Err(DisconnectReason::DuplicatePeer));

    let other_net = HelloMessage { genesis: stakenode::Block::genesis(42).id(), ..good.clone() };
    assert_eq!(node.engine.check_hello(&other_net), Err(DisconnectReason::IncompatibleChain));

    let forked = HelloMessage { solidified: stakenode::Block::genesis(7).id(), ..good.clone() };
    assert_eq!(node.engine.check_hello(&forked), Err(DisconnectReason::Forked));

    // a solidified block above ours cannot be judged yet
    let ahead = HelloMessage { solidified: chain_with(30, 9).head_id(), ..good };
    assert_eq!(node.engine.check_hello(&ahead), Ok(()));
}

#[tokio::test]
async fn test_keepalive_and_ping_timeout() {
    let mut cfg = Config::default();
    cfg.p2p.connection_timeout_secs = 0;
    cfg.p2p.max_retries = 0;
    let node = node_with(cfg, new_chain());
    let (a, mut rx_a) = connect(&node.engine, 1, node.chain.head_id());

    node.engine.keepalive();
    let msgs = sent(&mut rx_a);
    assert!(matches!(msgs.as_slice(), [Message::Ping(_)]));
    // a ping is already out
    node.engine.keepalive();
    assert!(sent(&mut rx_a).is_empty());

    // answering clears it
    if let [Message::Ping(nonce)] = msgs.as_slice() {
        node.engine.on_message(&a, Message::Pong(*nonce));
    }
    assert_eq!(a.pending_round_trips(), 0);

    node.engine.keepalive();
    sent(&mut rx_a);
    std::thread::sleep(Duration::from_millis(5));
    node.engine.check_round_trips();
    assert_eq!(disconnect_reason(&sent(&mut rx_a)), Some(DisconnectReason::PingTimeout));
}

#[tokio::test]
async fn test_ping_is_answered() {
    let node = node(new_chain());
    let (a, mut rx_a) = connect(&node.engine, 1, node.chain.head_id());
    node.engine.on_message(&a, Message::Ping(99));
    assert_eq!(sent(&mut rx_a), vec![Message::Pong(99)]);
}

#[tokio::test]
async fn test_hello_after_handshake_is_bad_protocol() {
    let node = node(new_chain());
    let (a, mut rx_a) = connect(&node.engine, 1, node.chain.head_id());
    node.engine.on_message(&a, Message::Hello(node.engine.local_hello()));
    assert_eq!(disconnect_reason(&sent(&mut rx_a)), Some(DisconnectReason::BadProtocol));
}

#[tokio::test]
async fn test_prune_drops_worst_score_first() {
    let mut cfg = Config::default();
    cfg.p2p.max_active_peers = 2;
    let node = node_with(cfg, new_chain());
    let head = node.chain.head_id();
    let (a, _rx_a) = connect(&node.engine, 1, head);
    let (b, mut rx_b) = connect(&node.engine, 2, head);
    let (c, _rx_c) = connect(&node.engine, 3, head);

    node.engine.pool().record_failure(b.listen_addr());
    node.engine.check_peers();

    assert!(b.is_disconnected());
    assert!(!a.is_disconnected());
    assert!(!c.is_disconnected());
    assert_eq!(disconnect_reason(&sent(&mut rx_b)), Some(DisconnectReason::TooManyPeers));
}

#[tokio::test]
async fn test_fill_up_prefers_best_candidates() {
    let mut cfg = config::P2p::default();
    cfg.max_active_peers = 10;
    cfg.connect_factor = 0.3;
    cfg.active_factor = 0.1;
    let manager = ConnectionManager::new(&cfg);
    let local = SocketAddr::from(([127, 0, 0, 1], 18888));
    let pool = ConnectionPool::new(&cfg, [local]);

    let addrs: Vec<SocketAddr> = (1..=5).map(peer_addr).collect();
    for a in &addrs {
        pool.add_candidate(*a);
    }
    pool.add_candidate(local);
    pool.record_success(addrs[3]);
    pool.record_success(addrs[1]);
    pool.record_success(addrs[1]);
    pool.record_disconnect(addrs[0], DisconnectReason::BadBlock);
    assert_eq!(pool.score(&addrs[1]), 6);
    assert_eq!(pool.score(&addrs[0]), -100);

    // three slots: 10 * 0.3 with no peers
    let picked = pool.fill_up(&manager);
    assert_eq!(picked.len(), 3);
    assert_eq!(picked[0], addrs[1]);
    assert_eq!(picked[1], addrs[3]);
    assert!(!picked.contains(&local));

    // dialed addresses wait out the dial cache
    let again = pool.fill_up(&manager);
    assert!(again.iter().all(|a| !picked.contains(a)));
    assert!(pool.is_can_connect(&manager));
}

#[test]
fn test_candidate_list_is_bounded() {
    let mut cfg = config::P2p::default();
    cfg.max_candidates = 3;
    let pool = ConnectionPool::new(&cfg, Vec::<SocketAddr>::new());
    for n in 1..=5 {
        pool.add_candidate(peer_addr(n));
    }
    assert_eq!(pool.candidates(), 3);
    assert!(!pool.is_candidate(&peer_addr(1)));
    assert!(!pool.is_candidate(&peer_addr(2)));

    // a scored candidate outlives an idle one
    pool.record_success(peer_addr(3));
    pool.add_candidate(peer_addr(6));
    assert_eq!(pool.candidates(), 3);
    assert!(pool.is_candidate(&peer_addr(3)));
    assert!(!pool.is_candidate(&peer_addr(4)));
    assert_eq!(pool.score(&peer_addr(3)), 3);
}

#[tokio::test]
async fn test_repeat_offender_is_forgotten() {
    let cfg = config::P2p::default();
    let manager = ConnectionManager::new(&cfg);
    let pool = ConnectionPool::new(&cfg, Vec::<SocketAddr>::new());
    let (bad, good) = (peer_addr(1), peer_addr(2));
    pool.add_candidate(bad);
    pool.add_candidate(good);

    pool.record_disconnect(bad, DisconnectReason::BadBlock);
    pool.record_disconnect(bad, DisconnectReason::BadBlock);
    assert_eq!(pool.score(&bad), -200);
    assert!(pool.is_candidate(&bad));

    pool.record_disconnect(bad, DisconnectReason::BadBlock);
    assert!(!pool.is_candidate(&bad));
    assert_eq!(pool.candidates(), 1);
    assert_eq!(pool.fill_up(&manager), vec![good]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_duplicates_keep_earliest_session() {
    let node = node(new_chain());
    let head = node.chain.head_id();
    let (first, _rx_first) = fake_peer(&node.engine, 1, Direction::Outbound, head);
    let mut sessions = vec![first.clone()];
    let mut receivers = Vec::new();
    for n in 2..=8 {
        std::thread::sleep(Duration::from_millis(1));
        let (p, rx) = stakenode::PeerConnection::new(
            peer_addr(n),
            Direction::Outbound,
            first.hello().clone(),
            node.chain.genesis_id(),
        );
        sessions.push(p);
        receivers.push(rx);
    }

    // register latest first so earlier sessions have to displace later ones
    let results: Vec<_> = std::thread::scope(|s| {
        let handles: Vec<_> = sessions
            .iter()
            .rev()
            .map(|p| {
                let engine = &node.engine;
                s.spawn(move || (p.clone(), engine.register_peer(p)))
            })
            .collect();
        handles.into_iter().map(|h| h.join().expect("register thread")).collect()
    });

    let kept = node.engine.manager().get(&first.node_id()).expect("registered");
    assert!(std::sync::Arc::ptr_eq(&kept, &first));
    assert_eq!(node.engine.manager().len(), 1);
    assert!(!first.is_disconnected());
    for (p, result) in results {
        if std::sync::Arc::ptr_eq(&p, &first) {
            assert_eq!(result, Ok(()));
        } else {
            assert!(result == Err(DisconnectReason::DuplicatePeer) || p.is_disconnected());
        }
    }
}
