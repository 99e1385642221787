//! `obsd`: run the observatory daemons and talk to them.
//!
//! # Usage
//!
//! Run every daemon in one process on the simulated hardware:
//! ```bash
//! obsd --config obs.toml run all
//! ```
//!
//! Query and command a running daemon:
//! ```bash
//! obsd info dome --force
//! obsd call dome open_dome '{"side": "a_side", "frac": 0.5}'
//! obsd call exq add '{"uts": [1, 2], "exptime": 30, "nexp": 3, "filt": "R"}'
//! obsd shutdown exq
//! ```

mod launch;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use obs_core::config::{ObsConfig, DAEMON_IDS};
use obs_core::control::Pingable;
use obs_core::logging;
use obs_server::DaemonProxy;
use serde_json::Value;
use std::path::PathBuf;
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "obsd")]
#[command(about = "Robotic observatory control daemons", long_about = None)]
struct Cli {
    /// Configuration file (TOML). Missing files fall back to defaults.
    #[arg(long, default_value = "obs.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start daemons and serve them until shut down
    Run {
        /// Daemon ids, or `all`
        #[arg(required = true)]
        daemons: Vec<String>,
    },

    /// Check that a daemon's control loop is alive
    Ping { daemon: String },

    /// Print a daemon's latest status snapshot
    Info {
        daemon: String,
        /// Wait for a fresh hardware read
        #[arg(long)]
        force: bool,
    },

    /// Print a daemon's coarse status
    Status { daemon: String },

    /// Call any daemon method
    Call {
        daemon: String,
        method: String,
        /// Parameters as a JSON object
        #[arg(default_value = "{}")]
        params: String,
    },

    /// Stop a daemon
    Shutdown { daemon: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = ObsConfig::load_from(&cli.config)
        .with_context(|| format!("Loading {}", cli.config.display()))?;

    match cli.command {
        Commands::Run { daemons } => {
            logging::init_from_config(&config)?;
            run(&config, daemons).await
        }
        Commands::Ping { daemon } => print(proxy(&config, &daemon)?.ping().await?),
        Commands::Info { daemon, force } => {
            let snapshot: Value = proxy(&config, &daemon)?
                .call("get_info", serde_json::json!({ "force_update": force }))
                .await?;
            print(serde_json::to_string_pretty(&snapshot)?)
        }
        Commands::Status { daemon } => print(proxy(&config, &daemon)?.status().await?),
        Commands::Call {
            daemon,
            method,
            params,
        } => {
            let params: Value = serde_json::from_str(&params).context("Parameters must be JSON")?;
            match proxy(&config, &daemon)?.call(&method, params).await? {
                Value::String(ack) => print(ack),
                other => print(serde_json::to_string_pretty(&other)?),
            }
        }
        Commands::Shutdown { daemon } => print(proxy(&config, &daemon)?.shutdown().await?),
    }
}

fn print(message: impl std::fmt::Display) -> Result<()> {
    println!("{}", message);
    Ok(())
}

fn proxy(config: &ObsConfig, daemon: &str) -> Result<DaemonProxy> {
    let addr = config
        .daemons
        .get(daemon)
        .with_context(|| format!("Unknown daemon '{}', must be one of {:?}", daemon, DAEMON_IDS))?;
    Ok(DaemonProxy::new(daemon, addr.socket_addr(), config.rpc.timeout()))
}

async fn run(config: &ObsConfig, daemons: Vec<String>) -> Result<()> {
    let ids: Vec<String> = if daemons.iter().any(|d| d == "all") {
        DAEMON_IDS.iter().map(|id| id.to_string()).collect()
    } else {
        daemons
    };
    let mut launched = launch::launch(config, &ids).await?;

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                launched.shutdown_all();
                break;
            }
            joined = launched.servers.join_next() => {
                match joined {
                    Some(Ok(Ok(()))) => {}
                    Some(Ok(Err(e))) => error!("RPC server failed: {}", e),
                    Some(Err(e)) => error!("RPC server task panicked: {}", e),
                    None => return Ok(()),
                }
            }
        }
    }

    while let Some(joined) = launched.servers.join_next().await {
        if let Ok(Err(e)) = joined {
            warn!("RPC server failed during shutdown: {}", e);
        }
    }
    Ok(())
}
