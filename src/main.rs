use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use segrelay::{console, Relay, RelayIdentity, UdpBridge};

#[derive(Parser, Debug)]
#[command(name = "segrelay")]
#[command(author, version, long_about = None)]
#[command(about = "Relay local UDP broadcasts across a TCP mesh of peer relays")]
struct Args {
    /// Relay identity, fixed width: XXX.XXX.XXX.XXX:YYYYY
    identity: String,

    /// TCP listen address for inbound peers (defaults to 0.0.0.0:<identity port>)
    #[arg(short, long)]
    listen: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    // Logs to stderr; stdout belongs to the console.
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let identity = RelayIdentity::parse(&args.identity)
        .context("invalid relay identity")?;
    let listen = args
        .listen
        .unwrap_or_else(|| SocketAddr::from((Ipv4Addr::UNSPECIFIED, identity.port())));

    let bridge = UdpBridge::bind(identity.group_addr(), identity.port())
        .await
        .context("bind local broadcast socket")?;
    let relay = Relay::start(identity, &listen.to_string(), Arc::new(bridge)).await?;
    info!("relay booted up at {identity}");

    // Graceful shutdown on quit or Ctrl+C
    tokio::select! {
        _ = console::run(&relay) => {
            info!("console closed, exiting");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal, exiting gracefully");
        }
    }

    relay.shutdown().await;
    Ok(())
}
