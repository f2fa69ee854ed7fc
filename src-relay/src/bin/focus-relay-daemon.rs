// focus-relay-daemon: long-lived relay process
//
// Responsibilities:
// - Own the relay socket and the PID file
// - Hold the canonical session book, schedule cell, and usage ledger
// - Log connection lifecycle events
// - Shut down cleanly on SIGINT/SIGTERM

use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use focus_relay_lib::{
    logging::{init_logging, LogConfig},
    relay::{
        authority::{Authorities, ScheduleCell},
        config::Config,
        error::RelayError,
        server::{RelayEvent, RelayServer},
    },
};
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Log lifecycle events until the server's event channel closes
async fn log_events(mut events: broadcast::Receiver<RelayEvent>) {
    loop {
        match events.recv().await {
            Ok(RelayEvent::Connected { id, label }) => {
                debug!(fd = id, connection = %label, "connected");
            }
            Ok(RelayEvent::PeerResolved { label, peer, .. }) => {
                info!(
                    connection = %label,
                    app = %peer.name,
                    identifier = %peer.identifier,
                    "peer identified"
                );
            }
            Ok(RelayEvent::Disconnected { label, peer, .. }) => match peer {
                Some(peer) => info!(connection = %label, app = %peer.name, "peer left"),
                None => debug!(connection = %label, "anonymous peer left"),
            },
            Err(broadcast::error::RecvError::Lagged(n)) => warn!("missed {} relay events", n),
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Resolves on SIGINT or SIGTERM
async fn shutdown_signal() {
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = signal::ctrl_c() => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

/// Run the relay until `shutdown` resolves
async fn run(config: Config, shutdown: impl Future<Output = ()>) -> Result<()> {
    let authorities = Authorities::new(Arc::new(ScheduleCell::default()));
    let server = RelayServer::new(config.socket_path.clone(), authorities);
    tokio::spawn(log_events(server.subscribe_events()));

    server
        .start()
        .await
        .with_context(|| format!("Failed to start relay at {}", config.socket_path.display()))?;
    config.write_pid().context("Failed to write PID file")?;
    info!(pid = std::process::id(), "Relay daemon running");

    shutdown.await;

    info!("Shutting down relay...");
    server.stop().await;
    if let Err(e) = config.remove_pid() {
        warn!("Failed to remove PID file: {}", e);
    }
    info!("Relay daemon stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env();
    config
        .ensure_dirs()
        .context("Failed to create runtime directory")?;

    if let Err(e) = init_logging(&LogConfig::from_config(&config)) {
        eprintln!("focus-relay-daemon: logging disabled: {}", e);
    }

    match run(config.clone(), shutdown_signal()).await {
        Ok(()) => Ok(()),
        Err(e) => {
            if let Some(RelayError::AlreadyRunning(path)) = e.downcast_ref::<RelayError>() {
                error!(
                    "Relay already running at {} (PID: {:?})",
                    path.display(),
                    config.read_pid()
                );
                std::process::exit(1);
            }
            Err(e)
        }
    }
}
