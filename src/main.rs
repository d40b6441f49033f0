mod cache;
mod config;
mod context;
mod error;
mod feed;
mod fleet;
mod freshness;
mod identity;
mod logging;
mod poller;
mod push;
mod resolver;
mod server;
mod status;
mod types;

use clap::Parser;
use color_eyre::Result;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "fleetwatch")]
#[command(about = "Live bus positions from GTFS-realtime feeds and a push hub")]
#[command(version)]
struct Args {
  /// Path to config file (default: ./fleetwatch.yaml, then $XDG_CONFIG_HOME/fleetwatch/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Listen address, overriding `server.bind`
  #[arg(short, long)]
  bind: Option<SocketAddr>,

  /// Listen port, applied after `--bind`
  #[arg(short, long, env = "PORT")]
  port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let mut config = config::Config::load(args.config.as_deref())?;
  if let Some(bind) = args.bind {
    config.server.bind = bind;
  }
  if let Some(port) = args.port {
    config.server.bind = SocketAddr::new(config.server.bind.ip(), port);
  }

  let _guard = logging::init(&config.logging)?;
  let bind = config.server.bind;

  let ctx = context::AppContext::new(config)?;
  ctx.start_ingestion();

  let listener = tokio::net::TcpListener::bind(bind).await?;
  info!(addr = %bind, "listening");
  axum::serve(listener, ctx.router())
    .with_graceful_shutdown(shutdown_signal())
    .await?;

  Ok(())
}

async fn shutdown_signal() {
  if tokio::signal::ctrl_c().await.is_err() {
    // No signal handler; run until killed
    std::future::pending::<()>().await;
  }
  info!("shutting down");
}
