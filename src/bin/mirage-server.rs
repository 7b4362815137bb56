//! Mirage Tunnel Server
//!
//! The inside peer: accepts disguised tunnel connections on the listen
//! address, pools the resulting mux sessions, and dispatches reverse streams
//! for every local TCP/UDP listener in the map table. Probes that fail the
//! upgrade validation only ever see decoy pages.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use mirage_tunnel::config::{Config, MapProto, Mode};
use mirage_tunnel::pool::{self, SessionPool};
use mirage_tunnel::transport;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

/// Mirage Tunnel Server
#[derive(Parser, Debug)]
#[command(name = "mirage-server")]
#[command(about = "Anti-censorship tunnel server disguised as a web host")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Listen address (overrides config)
    #[arg(short, long)]
    listen: Option<String>,

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

    let mut cfg = Config::load(&args.config).context("failed to load configuration")?;
    if cfg.mode != Mode::Server {
        return Err(anyhow!("config mode is not \"server\""));
    }
    if let Some(listen) = args.listen {
        cfg.listen = listen;
    }
    if cfg.listen.is_empty() {
        return Err(anyhow!("listen address is required in server mode"));
    }

    let acceptor = match (&cfg.tls_cert, &cfg.tls_key) {
        (Some(cert), Some(key)) => {
            let acceptor = transport::tls::build_acceptor(cert, key)
                .context("failed to build TLS acceptor")?;
            info!("TLS termination enabled, cert: {}", cert);
            Some(acceptor)
        }
        (None, None) => None,
        _ => return Err(anyhow!("tls_cert and tls_key must be set together")),
    };

    let cfg = Arc::new(cfg);
    let pool = Arc::new(SessionPool::new());
    pool::spawn_sweeper(pool.clone());

    if cfg.maps.is_empty() {
        return Err(anyhow!("no maps/forward listeners configured"));
    }
    for map in &cfg.maps {
        let pool = pool.clone();
        let bind = map.bind.clone();
        let target = map.target.clone();
        match map.proto {
            MapProto::Tcp => {
                tokio::spawn(async move {
                    if let Err(e) = mirage_tunnel::listener::serve_tcp_map(bind, target, pool).await
                    {
                        error!("tcp map failed: {}", e);
                    }
                });
            }
            MapProto::Udp => {
                tokio::spawn(async move {
                    if let Err(e) = mirage_tunnel::listener::serve_udp_map(bind, target, pool).await
                    {
                        error!("udp map failed: {}", e);
                    }
                });
            }
        }
    }

    info!("Mirage Tunnel Server v{}", mirage_tunnel::VERSION);
    info!("fake host: {}", cfg.mimic.fake_domain);
    info!("listening on {}", cfg.listen);

    let tunnel_listener = TcpListener::bind(&cfg.listen)
        .await
        .context("failed to bind tunnel listener")?;

    loop {
        tokio::select! {
            accepted = tunnel_listener.accept() => match accepted {
                Ok((conn, peer)) => {
                    debug!("tunnel connection from {}", peer);
                    let cfg = cfg.clone();
                    let pool = pool.clone();
                    let acceptor = acceptor.clone();
                    tokio::spawn(async move {
                        match transport::accept(conn, acceptor.as_ref(), &cfg).await {
                            Ok(session) => {
                                pool.add(session.clone()).await;
                                info!("session established ({} pooled)", pool.count().await);
                                // the outside peer never opens streams toward
                                // us; drain defensively until the session dies
                                while let Some(stream) = session.accept_stream().await {
                                    drop(stream);
                                }
                                pool.remove(&session).await;
                                debug!("session from {} ended", peer);
                            }
                            // decoy already answered; never an error in logs
                            Err(e) => debug!("connection from {} rejected: {}", peer, e),
                        }
                    });
                }
                Err(e) => error!("accept error: {}", e),
            },
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
        }
    }

    Ok(())
}
