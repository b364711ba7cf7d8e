//! Tactile server — entry point.
//!
//! Serves the Tactile device-control protocol over WebSocket.  Devices come
//! from the discovery back-ends configured in the TOML file; out of the box
//! that is the simulated back-end fed by `[[simulated_devices]]`.
//!
//! # Usage
//!
//! ```text
//! tactile-server [OPTIONS]
//!
//! Options:
//!   --config <PATH>  TOML configuration file [default: tactile-server.toml]
//!   --port   <PORT>  Override the listener port from the config file
//!   --bind   <ADDR>  Override the bind address from the config file
//! ```
//!
//! | Variable          | Description                         |
//! |-------------------|-------------------------------------|
//! | `TACTILE_CONFIG`  | Configuration file path             |
//! | `TACTILE_PORT`    | Listener port                       |
//! | `TACTILE_BIND`    | Bind address                        |
//! | `RUST_LOG`        | `tracing` filter (overrides config) |

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tactile_server::application::discovery::{DeviceEvent, DiscoveryBackend};
use tactile_server::infrastructure::simulated::SimulatedDiscovery;
use tactile_server::infrastructure::storage::config::{load_config, ServerConfig};
use tactile_server::infrastructure::transport::{run_server, BackendFactory};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

// ── CLI argument definitions ──────────────────────────────────────────────────

#[derive(Debug, Parser)]
#[command(
    name = "tactile-server",
    about = "WebSocket server for the Tactile device-control protocol",
    version
)]
struct Cli {
    /// Path of the TOML configuration file.  A missing file means defaults.
    #[arg(long, default_value = "tactile-server.toml", env = "TACTILE_CONFIG")]
    config: PathBuf,

    /// TCP port for the WebSocket listener.
    #[arg(long, env = "TACTILE_PORT")]
    port: Option<u16>,

    /// IP address to bind the WebSocket listener to.
    #[arg(long, env = "TACTILE_BIND")]
    bind: Option<String>,
}

impl Cli {
    /// Loads the config file and applies the command-line overrides.
    fn into_server_config(self) -> anyhow::Result<ServerConfig> {
        let mut config = load_config(&self.config)
            .with_context(|| format!("failed to load {}", self.config.display()))?;
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(bind) = self.bind {
            config.bind_address = bind;
        }
        Ok(config)
    }
}

fn simulated_backends(config: &ServerConfig) -> BackendFactory {
    let entries = config.simulated_devices.clone();
    Arc::new(move |events: mpsc::UnboundedSender<DeviceEvent>| {
        if entries.is_empty() {
            return Vec::new();
        }
        let backend: Arc<dyn DiscoveryBackend> =
            Arc::new(SimulatedDiscovery::from_config(&entries, events));
        vec![backend]
    })
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = cli.into_server_config()?;

    // `RUST_LOG` wins; otherwise the config file's level applies.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .init();

    info!(
        "Tactile server starting: name={:?}, max_ping_time={} ms, {} simulated device(s)",
        config.server_name,
        config.max_ping_time_ms,
        config.simulated_devices.len()
    );

    let shutdown = CancellationToken::new();
    let on_ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("received Ctrl+C; shutting down");
                on_ctrl_c.cancel();
            }
            Err(e) => tracing::error!("failed to listen for Ctrl+C signal: {e}"),
        }
    });

    let backends = simulated_backends(&config);
    run_server(config, backends, shutdown).await?;

    info!("Tactile server stopped");
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
