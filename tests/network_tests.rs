// Transport tests
// Frame codec limits, and two nodes syncing over loopback TCP.

mod common;

use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

use common::*;
use stakenode::config::Config;
use stakenode::message::{read_frame, write_frame, CodecError, DisconnectReason, Message};
use stakenode::network;
use stakenode::ChainDelegate;

#[tokio::test]
async fn test_frames_cross_a_stream() {
    let (mut a, mut b) = tokio::io::duplex(64 * 1024);
    let msg = Message::SyncBlockChain(vec![genesis().id()]);
    write_frame(&mut a, &msg, 1024).await.unwrap();
    write_frame(&mut a, &Message::Disconnect(DisconnectReason::TooManyPeers), 1024).await.unwrap();

    assert_eq!(read_frame(&mut b, 1024).await.unwrap(), msg);
    assert_eq!(
        read_frame(&mut b, 1024).await.unwrap(),
        Message::Disconnect(DisconnectReason::TooManyPeers)
    );
}

#[tokio::test]
async fn test_oversized_frames_are_refused() {
    let (mut a, mut b) = tokio::io::duplex(64 * 1024);
    let big = Message::SyncBlockChain(vec![genesis().id(); 100]);
    assert!(matches!(write_frame(&mut a, &big, 64).await, Err(CodecError::FrameTooLarge(_))));

    // a length prefix above the limit is rejected before the body is read
    a.write_all(&(1u32 << 30).to_be_bytes()).await.unwrap();
    assert!(matches!(read_frame(&mut b, 1024).await, Err(CodecError::FrameTooLarge(n)) if n == 1 << 30));
}

#[tokio::test]
async fn test_garbage_frame_fails_to_decode() {
    let (mut a, mut b) = tokio::io::duplex(1024);
    a.write_all(&4u32.to_be_bytes()).await.unwrap();
    a.write_all(&[0xff; 4]).await.unwrap();
    assert!(matches!(read_frame(&mut b, 1024).await, Err(CodecError::Decode(_))));
}

fn loopback() -> Config {
    let mut cfg = Config::default();
    cfg.net.listen_ip = "127.0.0.1".into();
    cfg.net.listen_port = 0;
    cfg.p2p.fill_up_interval_ms = 3_600_000;
    cfg
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_two_nodes_sync_and_gossip_over_tcp() {
    let a = node_with(loopback(), chain_with(5, 1));
    let b = node_with(loopback(), new_chain());
    a.engine.spawn(&a.shutdown);
    b.engine.spawn(&b.shutdown);
    let net_a = network::spawn(a.engine.clone(), &a.shutdown).await.unwrap();
    let net_b = network::spawn(b.engine.clone(), &b.shutdown).await.unwrap();

    net_b.connect(net_a.local_addr());

    let (chain_a, chain_b) = (a.chain.clone(), b.chain.clone());
    assert!(
        eventually(Duration::from_secs(10), || chain_b.head_id() == chain_a.head_id()).await,
        "node b never caught up"
    );
    assert_eq!(b.chain.main_ids(), a.chain.main_ids());

    // once a stops serving b, new blocks travel by gossip
    let engine_a = Arc::clone(&a.engine);
    assert!(
        eventually(Duration::from_secs(10), || {
            let peers = engine_a.manager().active_peers();
            peers.len() == 1 && !peers[0].state().in_sync()
        })
        .await
    );
    let block = a.chain.produce_block(stakenode::now_ms(), [1; 32]).unwrap();
    a.engine.broadcast_block(&block);
    assert!(
        eventually(Duration::from_secs(10), || chain_b.head_id() == block.id()).await,
        "gossiped block never arrived"
    );
    assert_eq!(b.chain.head_id().num, 6);

    let _ = a.shutdown.send(());
    let _ = b.shutdown.send(());
}

#[tokio::test]
async fn test_incompatible_chain_is_refused() {
    let a = node_with(loopback(), new_chain());
    let other_genesis = stakenode::MemoryChain::new(stakenode::Block::genesis(99), &Default::default());
    let b = node_with(loopback(), Arc::new(other_genesis));
    let net_a = network::spawn(a.engine.clone(), &a.shutdown).await.unwrap();
    let net_b = network::spawn(b.engine.clone(), &b.shutdown).await.unwrap();

    net_b.connect(net_a.local_addr());
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(a.engine.manager().is_empty());
    assert!(b.engine.manager().is_empty());

    let _ = a.shutdown.send(());
    let _ = b.shutdown.send(());
}

#[tokio::test]
async fn test_failed_write_ends_the_session() {
    let mut cfg = Config::default();
    cfg.p2p.max_frame_bytes = 256;
    let node = node_with(cfg, new_chain());
    let (peer, out_rx) = connect(&node.engine, 1, node.chain.head_id());
    let (wr, mut rd) = tokio::io::duplex(64 * 1024);
    let writer = tokio::spawn(network::run_writer(node.engine.clone(), peer.clone(), out_rx, wr));

    peer.queue_send(Message::Ping(1));
    assert_eq!(read_frame(&mut rd, 256).await.unwrap(), Message::Ping(1));

    // too big for one frame
    peer.queue_send(Message::SyncBlockChain(vec![genesis().id(); 100]));
    tokio::time::timeout(Duration::from_secs(2), writer)
        .await
        .expect("writer stopped in time")
        .expect("writer task");
    assert!(peer.is_disconnected());
    assert!(node.engine.manager().is_empty());
    assert!(node.engine.manager().is_recently_disconnected(&peer.ip()));
}
