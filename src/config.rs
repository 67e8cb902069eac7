use serde::Deserialize;
use std::time::Duration;
use std::{fs, path::Path};
use anyhow::{Context, Result};

/// Node configuration. Every key has a default, so an empty file is valid.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub net: Net,
    pub p2p: P2p,
    pub sync: Sync,
    pub chain: Chain,
    pub dispatcher: Dispatcher,
    pub metrics: Metrics,
    pub log: Log,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Net {
    pub listen_ip: String,
    pub listen_port: u16,
    /// `host:port` seeds dialed on startup.
    pub bootstrap: Vec<String>,
    pub identity_path: String,
}

impl Default for Net {
    fn default() -> Self {
        Self {
            listen_ip: "0.0.0.0".into(),
            listen_port: 18888,
            bootstrap: Vec::new(),
            identity_path: "node_identity.key".into(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct P2p {
    pub max_active_peers: usize,
    pub max_peers_per_ip: usize,
    /// Share of `max_active_peers` the pool keeps dialing towards.
    pub connect_factor: f64,
    /// Share of `max_active_peers` reserved for outbound connections.
    pub active_factor: f64,
    pub connection_timeout_secs: u64,
    pub handshake_timeout_secs: u64,
    pub max_retries: u32,
    pub max_frame_bytes: usize,
    pub bad_peer_ban_secs: u64,
    pub recent_disconnect_secs: u64,
    pub dial_cache_secs: u64,
    /// Addresses the pool remembers as dial candidates.
    pub max_candidates: usize,
    pub fill_up_interval_ms: u64,
    pub keepalive_interval_secs: u64,
    /// IPs exempt from peer limits and bans.
    pub trusted: Vec<String>,
}

impl Default for P2p {
    fn default() -> Self {
        Self {
            max_active_peers: 30,
            max_peers_per_ip: 2,
            connect_factor: 0.3,
            active_factor: 0.1,
            connection_timeout_secs: 20,
            handshake_timeout_secs: 10,
            max_retries: 1,
            max_frame_bytes: 4 * 1024 * 1024,
            bad_peer_ban_secs: 3600,
            recent_disconnect_secs: 30,
            dial_cache_secs: 180,
            max_candidates: 10_000,
            fill_up_interval_ms: 3600,
            keepalive_interval_secs: 10,
            trusted: Vec::new(),
        }
    }
}

impl P2p {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Sync {
    pub block_interval_ms: u64,
    /// Gossip cache window, in block intervals.
    pub gossip_window_blocks: u64,
    pub max_fetch_per_peer: usize,
    pub max_block_fetch_per_peer: usize,
    pub sync_fetch_batch: usize,
    pub max_inventory_size: usize,
    pub max_spread_size: usize,
    pub adv_timeout_ms: u64,
    pub sync_timeout_ms: u64,
    pub block_update_timeout_ms: u64,
    pub max_clock_drift_ms: u64,
    pub advertise_interval_ms: u64,
    pub fetch_interval_ms: u64,
    pub sync_interval_ms: u64,
    pub check_interval_ms: u64,
    pub status_interval_secs: u64,
}

impl Default for Sync {
    fn default() -> Self {
        Self {
            block_interval_ms: 3000,
            gossip_window_blocks: 5,
            max_fetch_per_peer: 1000,
            max_block_fetch_per_peer: 100,
            sync_fetch_batch: 2000,
            max_inventory_size: 1000,
            max_spread_size: 50_000,
            adv_timeout_ms: 20_000,
            sync_timeout_ms: 5_000,
            block_update_timeout_ms: 20_000,
            max_clock_drift_ms: 3_600_000,
            advertise_interval_ms: 100,
            fetch_interval_ms: 30,
            sync_interval_ms: 10,
            check_interval_ms: 1000,
            status_interval_secs: 10,
        }
    }
}

impl Sync {
    pub fn gossip_window(&self) -> Duration {
        Duration::from_millis(self.gossip_window_blocks * self.block_interval_ms)
    }

    pub fn block_interval(&self) -> Duration {
        Duration::from_millis(self.block_interval_ms)
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }

    pub fn adv_timeout(&self) -> Duration {
        Duration::from_millis(self.adv_timeout_ms)
    }

    pub fn block_update_timeout(&self) -> Duration {
        Duration::from_millis(self.block_update_timeout_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Chain {
    pub genesis_timestamp_ms: u64,
    pub fork_cache_capacity: usize,
    pub solidify_depth: u64,
    /// Seal a block from the pending pool every block interval.
    pub produce: bool,
}

impl Default for Chain {
    fn default() -> Self {
        Self { genesis_timestamp_ms: 0, fork_cache_capacity: 1024, solidify_depth: 19, produce: false }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Dispatcher {
    pub workers: usize,
    pub max_queue: usize,
    pub contract_batch: usize,
    pub contract_drain_interval_ms: u64,
    pub contract_ttl_ms: u64,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self { workers: 4, max_queue: 50_000, contract_batch: 100, contract_drain_interval_ms: 20, contract_ttl_ms: 60_000 }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Metrics {
    pub enabled: bool,
    pub bind: String,
}

impl Default for Metrics {
    fn default() -> Self {
        Self { enabled: false, bind: default_bind() }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Log {
    pub level: String,
    pub json: bool,
}

impl Default for Log {
    fn default() -> Self {
        Self { level: "info".into(), json: false }
    }
}

fn default_bind() -> String { "127.0.0.1:9100".into() }

/// Read the TOML file at `p` and deserialize into `Config`.
/// *Adds context* so user errors print a friendlier message.
///
/// # Errors
/// * Returns an anyhow::Error if the file cannot be read or parsed.
pub fn load<P: AsRef<Path>>(p: P) -> Result<Config> {
    let text = fs::read_to_string(&p)
        .with_context(|| format!("🗂️  couldn’t read config file {}", p.as_ref().display()))?;
    load_from_str(&text)
}

pub fn load_from_str(text: &str) -> Result<Config> {
    toml::from_str(text)
        .with_context(|| "📝  invalid TOML in config file".to_string())
}
