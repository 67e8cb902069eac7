// Library interface for the stakenode sync engine
// This allows tests and the node binary to share the same modules

pub mod block;
pub mod cache;
pub mod chain;
pub mod config;
pub mod connection_manager;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod fork_cache;
pub mod gossip;
pub mod inventory;
pub mod logging;
pub mod memory_chain;
pub mod message;
pub mod metrics;
pub mod network;
pub mod peer;
pub mod pool;
pub mod rate;
pub mod sync;
pub mod transaction;

pub use block::{Block, BlockId, Hash};
pub use chain::{ChainDelegate, ChainError};
pub use config::Config;
pub use engine::SyncEngine;
pub use fork_cache::ForkCache;
pub use memory_chain::MemoryChain;
pub use message::{DisconnectReason, Message, NodeId};
pub use peer::PeerConnection;
pub use transaction::Transaction;

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
