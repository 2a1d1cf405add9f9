//! Central service daemon.

use std::path::PathBuf;

use anyhow::Error;
use clap::Parser;
use log::info;
use tokio::sync::watch;

use sagiri_guard::config::ServerConfig;
use sagiri_guard::server;

#[derive(Parser)]
#[command(name = "sagiri-guard-server", about = "Central backup service")]
struct Args {
    /// Path to the server configuration file.
    #[arg(long, default_value = "/etc/sagiri-guard/server.json")]
    config: PathBuf,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<(), Error> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = ServerConfig::load(&args.config)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let service = tokio::spawn(server::run(config, shutdown_rx));

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    let _ = shutdown_tx.send(true);

    service.await??;
    Ok(())
}
