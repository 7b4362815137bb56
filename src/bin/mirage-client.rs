//! Mirage Tunnel Client
//!
//! The outside peer: keeps N disguised transports alive against the
//! configured candidate paths, serves reverse streams the server opens
//! (dialing the requested local targets), and rotates paths when one turns
//! out to be blocked.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use mirage_tunnel::config::{Config, Mode};
use mirage_tunnel::connector;
use mirage_tunnel::pool::{self, SessionPool};
use std::sync::Arc;
use tracing::info;

/// Mirage Tunnel Client
#[derive(Parser, Debug)]
#[command(name = "mirage-client")]
#[command(about = "Anti-censorship tunnel client with multi-path failover")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(args.log_level.as_str())
        .init();

    let cfg = Config::load(&args.config).context("failed to load configuration")?;
    if cfg.mode != Mode::Client {
        return Err(anyhow!("config mode is not \"client\""));
    }
    if cfg.paths.is_empty() {
        return Err(anyhow!("at least one path is required in client mode"));
    }

    let cfg = Arc::new(cfg);
    let sessions = Arc::new(SessionPool::new());
    pool::spawn_sweeper(sessions.clone());

    info!("Mirage Tunnel Client v{}", mirage_tunnel::VERSION);
    for (i, path) in cfg.paths.iter().enumerate() {
        info!(
            "path[{}] {} ({:?}, pool {})",
            i, path.addr, path.transport, path.connection_pool
        );
        for slot in 0..path.connection_pool {
            tokio::spawn(connector::run_path_worker(
                cfg.clone(),
                sessions.clone(),
                i,
                slot,
            ));
        }
    }

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    Ok(())
}
