use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::Path;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::broadcast;
use tokio::time::{interval, Duration};
use tracing::{info, warn};

use stakenode::block::Block;
use stakenode::memory_chain::MemoryChain;
use stakenode::{config, logging, metrics, network, now_ms, Config, SyncEngine};

#[derive(Parser)]
#[command(author, version, about = "stakenode peer-to-peer sync node")]
struct Cli {
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Suppress routine network gossip logs
    #[arg(long, default_value_t = false)]
    quiet_net: bool,

    #[command(subcommand)]
    cmd: Option<Cmd>,
}

#[derive(Subcommand)]
enum Cmd {
    /// Run the node (default)
    Run,
    /// Print the local node id and exit
    NodeId,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let cfg = if Path::new(&cli.config).exists() {
        config::load(&cli.config)?
    } else {
        eprintln!("⚠️  Config file '{}' not found, using defaults", cli.config);
        Config::default()
    };
    logging::init(&cfg.log, cli.quiet_net)?;

    match cli.cmd.unwrap_or(Cmd::Run) {
        Cmd::NodeId => {
            let id = network::load_or_create_node_id(&cfg.net.identity_path)?;
            println!("{}", hex::encode(id.0));
            Ok(())
        }
        Cmd::Run => run(cfg).await,
    }
}

async fn run(cfg: Config) -> anyhow::Result<()> {
    let node_id = network::load_or_create_node_id(&cfg.net.identity_path)?;
    let genesis = Block::genesis(cfg.chain.genesis_timestamp_ms);
    info!(node = %node_id, genesis = %genesis.id(), "starting node");
    let chain = Arc::new(MemoryChain::new(genesis, &cfg.chain));

    let metrics = Arc::new(metrics::Metrics::new().context("couldn't build metrics registry")?);
    if cfg.metrics.enabled {
        metrics::serve(cfg.metrics.clone(), metrics.clone())?;
    }

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let engine = SyncEngine::new(cfg.clone(), node_id, chain.clone(), metrics, &shutdown_tx);
    engine.spawn(&shutdown_tx);
    let net = network::spawn(engine.clone(), &shutdown_tx).await?;
    info!(addr = %net.local_addr(), "network up");

    if cfg.chain.produce {
        let engine = engine.clone();
        let chain = chain.clone();
        let mut shutdown_rx = shutdown_tx.subscribe();
        let period = Duration::from_millis(cfg.sync.block_interval_ms.max(1));
        tokio::spawn(async move {
            let mut tick = interval(period);
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = tick.tick() => match chain.produce_block(now_ms(), node_id.0) {
                        Ok(block) => engine.broadcast_block(&block),
                        Err(e) => warn!(error = %e, "block production failed"),
                    },
                }
            }
        });
    }

    signal::ctrl_c().await.context("couldn't listen for ctrl-c")?;
    info!("shutdown requested");
    engine.shutdown_peers();
    // let writer tasks flush the disconnect frames
    tokio::time::sleep(Duration::from_millis(200)).await;
    let _ = shutdown_tx.send(());
    info!("node stopped");
    Ok(())
}
