// Configuration and identity tests

use std::io::Write;
use tempfile::{tempdir, NamedTempFile};

use stakenode::config::{self, Config};
use stakenode::{logging, network};

#[test]
fn test_defaults() {
    let cfg = Config::default();
    assert_eq!(cfg.net.listen_port, 18888);
    assert_eq!(cfg.p2p.max_active_peers, 30);
    assert_eq!(cfg.p2p.max_peers_per_ip, 2);
    assert_eq!(cfg.p2p.max_retries, 1);
    assert_eq!(cfg.p2p.max_candidates, 10_000);
    assert_eq!(cfg.sync.max_inventory_size, 1000);
    assert_eq!(cfg.sync.sync_fetch_batch, 2000);
    assert_eq!(cfg.sync.gossip_window().as_millis(), 15_000);
    assert_eq!(cfg.chain.fork_cache_capacity, 1024);
    assert_eq!(cfg.dispatcher.contract_ttl_ms, 60_000);
    assert!(!cfg.metrics.enabled);
}

#[test]
fn test_empty_file_gives_defaults() {
    let file = NamedTempFile::new().unwrap();
    let cfg = config::load(file.path()).unwrap();
    assert_eq!(cfg.net.listen_ip, "0.0.0.0");
    assert_eq!(cfg.sync.block_interval_ms, 3000);
    assert_eq!(cfg.log.level, "info");
}

#[test]
fn test_partial_override() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
[net]
listen_port = 19000
bootstrap = ["10.0.0.1:18888"]

[p2p]
max_active_peers = 8
trusted = ["10.0.0.9"]

[sync]
block_interval_ms = 1000

[log]
json = true
"#
    )
    .unwrap();
    let cfg = config::load(file.path()).unwrap();
    assert_eq!(cfg.net.listen_port, 19000);
    assert_eq!(cfg.net.listen_ip, "0.0.0.0");
    assert_eq!(cfg.net.bootstrap, vec!["10.0.0.1:18888".to_string()]);
    assert_eq!(cfg.p2p.max_active_peers, 8);
    assert_eq!(cfg.p2p.max_peers_per_ip, 2);
    assert_eq!(cfg.p2p.trusted, vec!["10.0.0.9".to_string()]);
    assert_eq!(cfg.sync.gossip_window().as_millis(), 5_000);
    assert!(cfg.log.json);
    assert_eq!(cfg.log.level, "info");
}

#[test]
fn test_invalid_toml_is_an_error() {
    let err = config::load_from_str("[p2p\nmax_active_peers = ").unwrap_err();
    assert!(err.to_string().contains("invalid TOML"));

    let err = config::load_from_str("[p2p]\nmax_active_peers = \"many\"").unwrap_err();
    assert!(err.to_string().contains("invalid TOML"));
}

#[test]
fn test_missing_file_is_an_error() {
    let dir = tempdir().unwrap();
    let err = config::load(dir.path().join("absent.toml")).unwrap_err();
    assert!(err.to_string().contains("couldn"));
}

#[test]
fn test_log_filter() {
    let cfg = config::Log { level: "debug".into(), json: false };
    // RUST_LOG would override the configured level
    if std::env::var_os("RUST_LOG").is_none() {
        let quiet = logging::filter(&cfg, true).unwrap().to_string();
        assert!(quiet.contains("stakenode::gossip=warn"));
        assert!(quiet.contains("stakenode::network=warn"));
        let loud = logging::filter(&cfg, false).unwrap().to_string();
        assert!(!loud.contains("stakenode::gossip"));

        let bad = config::Log { level: "stakenode=loud".into(), json: false };
        assert!(logging::filter(&bad, false).is_err());
    }
}

#[test]
fn test_node_identity_persists() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("node_identity.key");
    let first = network::load_or_create_node_id(&path).unwrap();
    assert!(path.exists());
    let second = network::load_or_create_node_id(&path).unwrap();
    assert_eq!(first, second);

    std::fs::write(&path, "not hex").unwrap();
    assert!(network::load_or_create_node_id(&path).is_err());
    std::fs::write(&path, "abcd").unwrap();
    assert!(network::load_or_create_node_id(&path).is_err());
}
