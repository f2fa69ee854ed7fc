// focus-relay-host: native messaging host launched by the browser
//
// Connects to the relay socket and pumps frames between it and the
// extension's stdin/stdout. Logs go to stderr only; stdout carries frames.

use anyhow::{Context, Result};
use focus_relay_lib::{
    logging::{init_logging, LogConfig},
    relay::{config::Config, framing::framed_stdio, host::run_bridge},
};
use tokio::net::UnixStream;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env();

    if let Err(e) = init_logging(&LogConfig::from_config(&config)) {
        eprintln!("focus-relay-host: logging disabled: {}", e);
    }

    let relay = UnixStream::connect(&config.socket_path)
        .await
        .with_context(|| {
            format!(
                "Failed to connect to relay at {} (is focus-relay-daemon running?)",
                config.socket_path.display()
            )
        })?;
    info!(socket = %config.socket_path.display(), "Connected to relay");

    let (reader, writer) = framed_stdio();
    run_bridge(reader, writer, relay).await;

    // A pending stdin read cannot be cancelled and would hold up runtime shutdown
    std::process::exit(0);
}
