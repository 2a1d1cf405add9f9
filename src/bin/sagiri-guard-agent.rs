//! Endpoint agent daemon: observer, sync pump, backup and restore
//! dispatchers, command channel.

use std::path::PathBuf;

use anyhow::Error;
use clap::Parser;
use log::{info, warn};
use tokio::sync::{mpsc, watch};

use sagiri_guard::client::{backup, connection, restore, sync, Client};
use sagiri_guard::config::{self, AgentConfig};
use sagiri_guard::monitor::Observer;
use sagiri_guard::protocol::wire::CHANNEL_REQUEST;
use sagiri_guard::store::LocalStore;

#[derive(Parser)]
#[command(name = "sagiri-guard-agent", about = "Endpoint backup agent")]
struct Args {
    /// Path to the agent configuration file.
    #[arg(long, default_value = "/etc/sagiri-guard/agent.json")]
    config: PathBuf,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<(), Error> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = AgentConfig::load(&args.config)?;
    if config.watch_roots.is_empty() {
        warn!("no watch roots configured; only restores will be served");
    }

    let device_id = config::ensure_device_id(&config.data_dir)?;
    info!("device {}", device_id);

    let db_path = config.local_store_path();
    // create the schema up front so every worker connection finds it
    LocalStore::open(&db_path)?;

    let client = Client::new(config.server.clone());
    let hello = connection::device_register_info(&device_id, CHANNEL_REQUEST);
    match client.register(&hello).await {
        Ok(()) => info!("registered with {}", config.server),
        // workers reconnect on their own; registration retries with them
        Err(err) => warn!("registration failed - {}", err),
    }

    let observer = Observer::start(&device_id, &db_path, &config.watch_roots)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (command_tx, command_rx) = mpsc::channel(16);

    let mut tasks = Vec::new();
    tasks.push(tokio::spawn(sync_task(
        client.clone(),
        db_path.clone(),
        device_id.clone(),
        shutdown_rx.clone(),
    )));
    tasks.push(tokio::spawn(backup::run_dispatcher(
        client.clone(),
        db_path.clone(),
        device_id.clone(),
        shutdown_rx.clone(),
    )));
    tasks.push(tokio::spawn(restore::run_dispatcher(
        client.clone(),
        db_path.clone(),
        device_id.clone(),
        config.restore_fallback_dir(),
        command_rx,
        shutdown_rx.clone(),
    )));
    let command_channel = tokio::spawn(connection::run_command_channel(
        config.server.clone(),
        device_id.clone(),
        command_tx,
        shutdown_rx,
    ));

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    let _ = shutdown_tx.send(true);

    for task in tasks {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!("worker ended with error - {}", err),
            Err(err) => warn!("worker task ended abnormally - {}", err),
        }
    }
    let _ = command_channel.await;

    // close the event queue and drain the persistence workers last
    tokio::task::block_in_place(|| observer.stop());
    info!("stopped");
    Ok(())
}

async fn sync_task(
    client: std::sync::Arc<Client>,
    db_path: PathBuf,
    device_id: String,
    shutdown: watch::Receiver<bool>,
) -> Result<(), Error> {
    sync::run_pump(client, &db_path, device_id, shutdown).await
}
