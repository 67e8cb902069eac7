//! TCP transport: listener, dialer, handshake and the per-connection
//! reader and writer tasks.

use anyhow::{Context, Result};
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval, timeout, Duration};
use tracing::{debug, info, warn};

use crate::engine::SyncEngine;
use crate::message::{read_frame, write_frame, CodecError, DisconnectReason, Message, NodeId};
use crate::peer::{Direction, Outbound, PeerConnection};

pub type NetHandle = Arc<Network>;

#[derive(Debug, Clone)]
pub enum NetworkCommand {
    Connect(SocketAddr),
}

pub struct Network {
    command_tx: mpsc::UnboundedSender<NetworkCommand>,
    local_addr: SocketAddr,
}

impl Network {
    pub fn connect(&self, addr: SocketAddr) {
        let _ = self.command_tx.send(NetworkCommand::Connect(addr));
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

/// Read the node id from `path`, creating a random one on first start.
pub fn load_or_create_node_id<P: AsRef<Path>>(path: P) -> Result<NodeId> {
    let path = path.as_ref();
    if path.exists() {
        let text = fs::read_to_string(path)
            .with_context(|| format!("couldn't read node identity {}", path.display()))?;
        let bytes = hex::decode(text.trim()).context("node identity is not hex")?;
        let id: [u8; 32] = bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("node identity must be 32 bytes"))?;
        return Ok(NodeId(id));
    }
    let id = NodeId::random();
    fs::write(path, hex::encode(id.0))
        .with_context(|| format!("couldn't write node identity {}", path.display()))?;
    Ok(id)
}

/// Bind the listener, start dialing bootstrap peers and keep the pool filled.
pub async fn spawn(engine: Arc<SyncEngine>, shutdown: &broadcast::Sender<()>) -> Result<NetHandle> {
    let cfg = engine.config().clone();
    let bind = format!("{}:{}", cfg.net.listen_ip, cfg.net.listen_port);
    let listener = TcpListener::bind(&bind)
        .await
        .with_context(|| format!("couldn't listen on {bind}"))?;
    let local_addr = listener.local_addr()?;
    info!(addr = %local_addr, node = %engine.node_id(), "listening for peers");

    let (command_tx, mut command_rx) = mpsc::unbounded_channel::<NetworkCommand>();
    let net = Arc::new(Network { command_tx, local_addr });

    {
        let engine = engine.clone();
        let shutdown = shutdown.clone();
        let mut shutdown_rx = shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, addr)) => {
                            if let Err(reason) = engine.manager().admit(addr.ip(), Direction::Inbound) {
                                debug!(%addr, %reason, "refusing inbound connection");
                                tokio::spawn(refuse(stream, reason, engine.config().p2p.max_frame_bytes));
                                continue;
                            }
                            tokio::spawn(handle_connection(engine.clone(), stream, addr, Direction::Inbound, shutdown.subscribe()));
                        }
                        Err(e) => warn!(error = %e, "accept failed"),
                    },
                }
            }
            debug!("listener stopped");
        });
    }

    {
        let engine = engine.clone();
        let shutdown = shutdown.clone();
        let mut shutdown_rx = shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    cmd = command_rx.recv() => match cmd {
                        Some(NetworkCommand::Connect(addr)) => {
                            if let Err(reason) = engine.manager().admit(addr.ip(), Direction::Outbound) {
                                debug!(%addr, %reason, "not dialing");
                                continue;
                            }
                            tokio::spawn(dial(engine.clone(), addr, shutdown.subscribe()));
                        }
                        None => break,
                    },
                }
            }
        });
    }

    {
        let engine = engine.clone();
        let net = net.clone();
        let mut shutdown_rx = shutdown.subscribe();
        let period = Duration::from_millis(cfg.p2p.fill_up_interval_ms.max(100));
        tokio::spawn(async move {
            let mut tick = interval(period);
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = tick.tick() => {
                        for addr in engine.pool().fill_up(engine.manager()) {
                            net.connect(addr);
                        }
                        if engine.manager().is_empty() {
                            debug!("no active peers");
                        }
                    }
                }
            }
        });
    }

    for seed in &cfg.net.bootstrap {
        match tokio::net::lookup_host(seed.as_str()).await {
            Ok(addrs) => {
                for addr in addrs {
                    engine.pool().add_candidate(addr);
                    net.connect(addr);
                }
            }
            Err(e) => warn!(seed = %seed, error = %e, "couldn't resolve bootstrap peer"),
        }
    }

    Ok(net)
}

async fn refuse(mut stream: TcpStream, reason: DisconnectReason, max_frame: usize) {
    let _ = write_frame(&mut stream, &Message::Disconnect(reason), max_frame).await;
    let _ = stream.shutdown().await;
}

async fn dial(engine: Arc<SyncEngine>, addr: SocketAddr, shutdown_rx: broadcast::Receiver<()>) {
    let limit = engine.config().p2p.connection_timeout();
    match timeout(limit, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => handle_connection(engine, stream, addr, Direction::Outbound, shutdown_rx).await,
        Ok(Err(e)) => {
            debug!(%addr, error = %e, "dial failed");
            engine.pool().record_failure(addr);
        }
        Err(_) => {
            debug!(%addr, "dial timed out");
            engine.pool().record_failure(addr);
        }
    }
}

async fn handle_connection(
    engine: Arc<SyncEngine>,
    stream: TcpStream,
    addr: SocketAddr,
    direction: Direction,
    shutdown_rx: broadcast::Receiver<()>,
) {
    if let Err(e) = run_connection(engine, stream, addr, direction, shutdown_rx).await {
        debug!(%addr, error = %e, "connection ended");
    }
}

async fn run_connection(
    engine: Arc<SyncEngine>,
    stream: TcpStream,
    addr: SocketAddr,
    direction: Direction,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<()> {
    let _ = stream.set_nodelay(true);
    let max_frame = engine.config().p2p.max_frame_bytes;
    let (mut rd, mut wr) = stream.into_split();

    write_frame(&mut wr, &Message::Hello(engine.local_hello()), max_frame).await?;
    let hello = match timeout(engine.config().p2p.handshake_timeout(), read_frame(&mut rd, max_frame)).await {
        Ok(Ok(Message::Hello(hello))) => hello,
        Ok(Ok(Message::Disconnect(reason))) => {
            debug!(%addr, %reason, "peer refused handshake");
            return Ok(());
        }
        Ok(Ok(other)) => {
            let _ = write_frame(&mut wr, &Message::Disconnect(DisconnectReason::BadProtocol), max_frame).await;
            anyhow::bail!("expected hello, got {:?}", other.kind());
        }
        Ok(Err(e)) => return Err(e.into()),
        Err(_) => anyhow::bail!("handshake timed out"),
    };
    if let Err(reason) = engine.check_hello(&hello) {
        info!(%addr, %reason, "handshake rejected");
        let _ = write_frame(&mut wr, &Message::Disconnect(reason), max_frame).await;
        if direction == Direction::Outbound {
            engine.pool().record_disconnect(addr, reason);
        }
        return Ok(());
    }

    let (peer, out_rx) = PeerConnection::new(addr, direction, hello, engine.chain().genesis_id());
    tokio::spawn(run_writer(engine.clone(), peer.clone(), out_rx, wr));

    if let Err(reason) = engine.register_peer(&peer) {
        info!(%addr, %reason, "peer not admitted");
        engine.disconnect(&peer, reason);
        return Ok(());
    }

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            frame = read_frame(&mut rd, max_frame) => match frame {
                Ok(msg) => {
                    engine.on_message(&peer, msg);
                    if peer.is_disconnected() {
                        break;
                    }
                }
                Err(CodecError::Io(e)) => {
                    debug!(peer = %peer.node_id(), error = %e, "read failed");
                    engine.close_session(&peer, DisconnectReason::Requested);
                    break;
                }
                Err(e) => {
                    warn!(peer = %peer.node_id(), error = %e, "undecodable frame");
                    engine.disconnect(&peer, DisconnectReason::BadProtocol);
                    break;
                }
            },
        }
    }
    Ok(())
}

/// Drain `peer`'s outbound queue onto `wr`. A failed write ends the session.
pub async fn run_writer<W>(
    engine: Arc<SyncEngine>,
    peer: Arc<PeerConnection>,
    mut out_rx: mpsc::UnboundedReceiver<Outbound>,
    mut wr: W,
) where
    W: AsyncWrite + Unpin,
{
    let max_frame = engine.config().p2p.max_frame_bytes;
    while let Some(out) = out_rx.recv().await {
        match out {
            Outbound::Message(msg) => {
                if let Err(e) = write_frame(&mut wr, &msg, max_frame).await {
                    warn!(peer = %peer.node_id(), kind = ?msg.kind(), error = %e, "write failed, closing session");
                    engine.close_session(&peer, DisconnectReason::Requested);
                    break;
                }
            }
            Outbound::Close => break,
        }
    }
    let _ = wr.shutdown().await;
}
