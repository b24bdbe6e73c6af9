use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use syncstore::config;
use syncstore::{IdGen, List, ListInfo, Persistence};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "syncstore", about = "Coordination primitives over Redis")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "/etc/syncstore/config.yaml")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Establish every session and report the connection.
    Ping,
    /// Append a JSON object to a list.
    Push {
        list: String,
        /// JSON object payload.
        payload: String,
        #[arg(long, default_value_t = 3600)]
        expiry: u64,
        #[arg(long, default_value_t = 100)]
        max_length: usize,
    },
    /// Print the start id, end id and size of a list.
    Info { list: String },
    /// Replay a list from a last-seen id (or from the beginning).
    Read {
        list: String,
        #[arg(long)]
        from: Option<u64>,
    },
    /// Allocate ids from a counter scope.
    Alloc {
        scope: String,
        #[arg(long, default_value_t = 1)]
        count: usize,
    },
    /// Print messages published on a channel until interrupted.
    Subscribe { channel: String },
    /// Print the metrics exposition after connecting.
    Metrics,
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

async fn run(persistence: Arc<Persistence>, command: Command) -> Result<()> {
    match command {
        Command::Ping => {
            println!(
                "connected node={} migration={} read_from_replica={}",
                persistence.node_id(),
                persistence.migration_enabled(),
                persistence.read_from_replica()
            );
        }
        Command::Push {
            list,
            payload,
            expiry,
            max_length,
        } => {
            let payload: serde_json::Value =
                serde_json::from_str(&payload).context("payload is not valid JSON")?;
            let list = List::new(Arc::clone(&persistence), list, Some(expiry), max_length);
            let entry = list.push(&payload).await?;
            println!("{}", serde_json::to_string(&entry)?);
        }
        Command::Info { list } => {
            let list = List::new(Arc::clone(&persistence), list, None, 0);
            let info = list.info().await?;
            println!("{}", serde_json::to_string(&info)?);
        }
        Command::Read { list, from } => {
            let list = List::new(Arc::clone(&persistence), list, None, 0);
            let info: ListInfo = list.info().await?;
            match list.read(from, &info).await {
                Ok(entries) => {
                    for entry in entries {
                        println!("{}", serde_json::to_string(&entry)?);
                    }
                }
                Err(e) if e.is_sync() => {
                    anyhow::bail!("{e}; re-read without --from to resynchronize")
                }
                Err(e) => return Err(e.into()),
            }
        }
        Command::Alloc { scope, count } => {
            let id_gen = IdGen::new(Arc::clone(&persistence), scope, None);
            let pending: Vec<_> = (0..count).map(|_| id_gen.alloc()).collect();
            for id in pending {
                println!("{}", id.await?);
            }
        }
        Command::Subscribe { channel } => {
            let mut subscription = persistence.pubsub()?.subscribe(&channel).await?;
            tracing::info!(%channel, "subscribed, waiting for messages");
            loop {
                tokio::select! {
                    message = subscription.recv() => match message {
                        Some(message) => println!("{message}"),
                        None => break,
                    },
                    () = shutdown_signal() => break,
                }
            }
            persistence.pubsub()?.unsubscribe(&channel).await?;
        }
        Command::Metrics => {
            print!("{}", persistence.metrics_registry().render());
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    if let Err(e) = signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
    tracing::info!("received SIGINT");
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Config ----
    let settings = config::load_config(&cli.config)?;

    // ---- Tracing ----
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    tracing::info!(config_path = %cli.config, "starting syncstore");

    // ---- Store ----
    let persistence = Persistence::connect_with_redis(settings)
        .await
        .context("failed to connect to the store")?;
    tracing::info!(node_id = %persistence.node_id(), "store connected");

    let result = run(Arc::clone(&persistence), cli.command).await;

    persistence.disconnect().await;
    tracing::info!("syncstore shut down cleanly");
    result
}
