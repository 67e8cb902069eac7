use anyhow::Result;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::sync::Arc;
use std::thread;
use tracing::{error, info};

pub struct Metrics {
    pub registry: Registry,
    pub active_peers: IntGauge,
    pub fetch_queue: IntGauge,
    pub spread_queue: IntGauge,
    pub dispatcher_backlog: IntGauge,
    pub blocks_applied: IntCounter,
    pub txs_applied: IntCounter,
    pub disconnects: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        // Prefix metrics with `stakenode_` for better namespacing.
        let active_peers = IntGauge::new("stakenode_active_peers", "Handshaken peer sessions")?;
        let fetch_queue = IntGauge::new("stakenode_fetch_queue", "Advertised items waiting to be fetched")?;
        let spread_queue = IntGauge::new("stakenode_spread_queue", "Items waiting to be advertised")?;
        let dispatcher_backlog = IntGauge::new("stakenode_dispatcher_backlog", "Transactions queued for workers")?;
        let blocks_applied = IntCounter::new("stakenode_blocks_applied_total", "Blocks applied from peers")?;
        let txs_applied = IntCounter::new("stakenode_txs_applied_total", "Transactions accepted from peers")?;
        let disconnects = IntCounterVec::new(
            Opts::new("stakenode_disconnects_total", "Peer disconnects by reason"),
            &["reason"],
        )?;
        registry.register(Box::new(active_peers.clone()))?;
        registry.register(Box::new(fetch_queue.clone()))?;
        registry.register(Box::new(spread_queue.clone()))?;
        registry.register(Box::new(dispatcher_backlog.clone()))?;
        registry.register(Box::new(blocks_applied.clone()))?;
        registry.register(Box::new(txs_applied.clone()))?;
        registry.register(Box::new(disconnects.clone()))?;
        Ok(Self {
            registry,
            active_peers,
            fetch_queue,
            spread_queue,
            dispatcher_backlog,
            blocks_applied,
            txs_applied,
            disconnects,
        })
    }

    pub fn render(&self) -> Result<Vec<u8>> {
        let mut buffer = vec![];
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(buffer)
    }
}

pub fn serve(cfg: crate::config::Metrics, metrics: Arc<Metrics>) -> Result<()> {
    let server = tiny_http::Server::http(&cfg.bind)
        .map_err(|e| anyhow::anyhow!("could not start metrics server on {}: {}", cfg.bind, e))?;
    let content_type = tiny_http::Header::from_bytes(&b"Content-Type"[..], &b"text/plain; version=0.0.4; charset=utf-8"[..])
        .map_err(|_| anyhow::anyhow!("bad content type header"))?;
    info!(bind = %cfg.bind, "metrics endpoint listening");

    thread::spawn(move || {
        for request in server.incoming_requests() {
            let buffer = match metrics.render() {
                Ok(b) => b,
                Err(e) => {
                    error!(error = %e, "could not encode metrics");
                    continue;
                }
            };
            let response = tiny_http::Response::from_data(buffer).with_header(content_type.clone());
            let _ = request.respond(response);
        }
    });

    Ok(())
}
