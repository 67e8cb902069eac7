//! Logging setup.
//!
//! Builds a `tracing-subscriber` registry from the `[log]` section. `RUST_LOG`
//! overrides the configured level; `--quiet-net` silences routine gossip and
//! transport chatter while keeping warnings.

use anyhow::Context;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config;

const QUIET_NET_DIRECTIVES: &[&str] = &["stakenode::gossip=warn", "stakenode::network=warn"];

pub fn filter(cfg: &config::Log, quiet_net: bool) -> anyhow::Result<EnvFilter> {
    let mut filter = match EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => EnvFilter::try_new(&cfg.level).with_context(|| format!("bad log level {:?}", cfg.level))?,
    };
    if quiet_net {
        for directive in QUIET_NET_DIRECTIVES {
            filter = filter.add_directive(directive.parse()?);
        }
    }
    Ok(filter)
}

/// Install the global subscriber. Call once at startup.
pub fn init(cfg: &config::Log, quiet_net: bool) -> anyhow::Result<()> {
    let env_filter = filter(cfg, quiet_net)?;
    if cfg.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json().with_current_span(true))
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init()?;
    }
    Ok(())
}
