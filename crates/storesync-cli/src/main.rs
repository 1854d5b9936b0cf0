//! Storesync CLI
//!
//! Thin wrapper around storesync-core for operating a device from a terminal.
//!
//! ## Usage
//!
//! ```bash
//! # Show this device's identifier
//! storesync identity
//!
//! # Show connection state and collection sizes
//! storesync status
//!
//! # Print or replace a collection
//! storesync show partners
//! storesync set settings '{"currency":"EUR"}'
//!
//! # Sync with the full-sync service
//! storesync --server http://localhost:3000 pull
//! storesync --server http://localhost:3000 push
//!
//! # Run as a long-lived device
//! storesync --server http://localhost:3000 --realtime ws://localhost:3000/sync serve
//! ```

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use storesync_core::{
    CollectionName, PullOutcome, PushOutcome, SyncConfig, SyncEngine, SyncEvent,
};
use tokio::sync::broadcast;

/// Storesync - keep shared collections in sync across devices
#[derive(Parser)]
#[command(name = "storesync")]
#[command(version)]
#[command(about = "Storesync - keep shared collections in sync across devices")]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Data directory (default: ~/.storesync/data)
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    /// Full-sync service base URL (overrides config.json)
    #[arg(long, global = true)]
    server: Option<String>,

    /// Coordinating service WebSocket URL (overrides config.json)
    #[arg(long, global = true)]
    realtime: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show this device's identifier
    Identity,

    /// Show connection state and collection sizes
    Status,

    /// Print a collection as JSON
    Show {
        /// Collection name (staff, partners, distributors, products, feedback, settings, content)
        collection: String,
    },

    /// Replace a collection with a JSON value
    Set {
        /// Collection name
        collection: String,
        /// New value as JSON text
        value: String,
    },

    /// Pull the authoritative snapshot from the full-sync service
    Pull,

    /// Push every collection to the full-sync service and peers
    Push,

    /// Run the engine until Ctrl+C, printing sync events
    Serve,

    /// Print the effective configuration
    Config {
        /// Persist the effective configuration to the data directory
        #[arg(long)]
        write: bool,
    },
}

fn setup_logging(verbosity: u8) {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();
}

/// Get the default data directory (~/.storesync/data)
fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".storesync")
        .join("data")
}

/// Parse a collection name
fn parse_collection(s: &str) -> Result<CollectionName> {
    CollectionName::from_str(s).map_err(|_| {
        let known: Vec<&str> = CollectionName::ALL.iter().map(|n| n.as_str()).collect();
        anyhow::anyhow!(
            "Invalid collection '{}'. Must be one of: {}",
            s,
            known.join(", ")
        )
    })
}

/// Load config.json and apply command-line overrides
fn load_config(
    data_dir: &Path,
    server: Option<String>,
    realtime: Option<String>,
) -> Result<SyncConfig> {
    let mut config = SyncConfig::load(data_dir)
        .with_context(|| format!("Failed to load config from {}", data_dir.display()))?;
    if server.is_some() {
        config.server_url = server;
    }
    if realtime.is_some() {
        config.realtime_url = realtime;
    }
    Ok(config)
}

fn format_time(millis: i64) -> String {
    chrono::DateTime::from_timestamp_millis(millis)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| millis.to_string())
}

fn format_collections(names: &[CollectionName]) -> String {
    if names.is_empty() {
        return "(no changes)".to_string();
    }
    names
        .iter()
        .map(|n| n.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

fn print_event(event: &SyncEvent) {
    match event {
        SyncEvent::CollectionsApplied {
            collections,
            source,
        } => match source {
            Some(device) => println!(
                "[Applied] {} from {}",
                format_collections(collections),
                device
            ),
            None => println!("[Applied] {}", format_collections(collections)),
        },
        SyncEvent::PeerJoined { device_id } => println!("[Peer] {} joined", device_id),
        SyncEvent::PeerLeft { device_id } => println!("[Peer] {} left", device_id),
        SyncEvent::Pushed { collections } => {
            println!("[Pushed] {}", format_collections(collections))
        }
        SyncEvent::Pulled { trigger } => println!("[Pulled] {:?}", trigger),
        SyncEvent::SyncError {
            collection: Some(collection),
            message,
        } => println!("[Error] {}: {}", collection, message),
        SyncEvent::SyncError {
            collection: None,
            message,
        } => println!("[Error] {}", message),
        SyncEvent::UserNotice { message } => println!("[Notice] {}", message),
        SyncEvent::OrderNotification { payload } => println!("[Order] {}", payload),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    let data_dir = cli.data_dir.unwrap_or_else(default_data_dir);
    let config = load_config(&data_dir, cli.server, cli.realtime)?;

    if let Commands::Config { write } = cli.command {
        println!("{}", serde_json::to_string_pretty(&config)?);
        if write {
            config.save(&data_dir)?;
            println!();
            println!("Saved to {}", data_dir.display());
        }
        return Ok(());
    }

    let engine = SyncEngine::open(&data_dir, config)
        .with_context(|| format!("Failed to open data directory {}", data_dir.display()))?;

    match cli.command {
        Commands::Identity => {
            println!("Device ID: {}", engine.device_id());
        }

        Commands::Status => {
            let status = engine.status();
            let config = engine.config();

            println!("Device ID: {}", engine.device_id());
            println!("Data directory: {}", data_dir.display());
            println!();
            println!("Services:");
            println!(
                "  Full sync: {}",
                config.server_url.as_deref().unwrap_or("(not configured)")
            );
            println!(
                "  Real-time: {}",
                config.realtime_url.as_deref().unwrap_or("(not configured)")
            );
            println!();
            println!("Status: {}", status);
            if let Some(last) = status.last_sync_time {
                println!("Last sync: {}", format_time(last));
            }
            println!();
            println!("Collections:");
            for name in CollectionName::ALL {
                println!("  {:<13} {}", name.as_str(), engine.store().len(name));
            }
        }

        Commands::Show { collection } => {
            let name = parse_collection(&collection)?;
            let value = engine.store().get(name);
            println!("{}", serde_json::to_string_pretty(&value)?);
        }

        Commands::Set { collection, value } => {
            let name = parse_collection(&collection)?;
            let value: serde_json::Value = serde_json::from_str(&value)
                .with_context(|| format!("Invalid JSON for {}", name))?;
            engine.store().set_local(name, value)?;
            println!("Updated {} ({} records)", name, engine.store().len(name));

            if engine.config().server_url.is_some() {
                match engine.push_now().await? {
                    PushOutcome::Pushed(_) => println!("Pushed to the full-sync service."),
                    PushOutcome::Busy => println!("Sync in flight; run `storesync push` later."),
                }
            }
        }

        Commands::Pull => match engine.pull_now().await? {
            PullOutcome::Applied(names) => {
                println!("Pulled: {}", format_collections(&names));
            }
            PullOutcome::Busy => println!("Sync already in flight."),
        },

        Commands::Push => match engine.push_now().await? {
            PushOutcome::Pushed(names) => {
                println!("Pushed: {}", format_collections(&names));
            }
            PushOutcome::Busy => println!("Sync already in flight."),
        },

        Commands::Serve => {
            println!("Starting storesync...");
            println!();
            println!("Device ID: {}", engine.device_id());
            println!("Data directory: {}", data_dir.display());
            println!();

            let mut events = engine.subscribe();
            engine.start().await?;

            println!("Status: {}", engine.status());
            println!();
            println!("Device is running. Press Ctrl+C to stop.");
            println!();

            let status_interval = Duration::from_secs(60);
            let mut ticker = tokio::time::interval(status_interval);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        println!();
                        println!("Received shutdown signal...");
                        break;
                    }
                    event = events.recv() => match event {
                        Ok(event) => print_event(&event),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "Event listener lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = ticker.tick() => {
                        println!("[Status] {}", engine.status());
                    }
                }
            }

            println!("Shutting down...");
            engine.shutdown().await;
            println!("Goodbye.");
        }

        Commands::Config { .. } => {}
    }

    Ok(())
}
