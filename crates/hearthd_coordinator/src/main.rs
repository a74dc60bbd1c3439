use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use hearthd_coordinator::Config;
use hearthd_coordinator::Entries;
use hearthd_coordinator::EntryEvent;
use hearthd_coordinator::api;
use hearthd_coordinator::sources;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing_subscriber::prelude::*;

#[derive(Debug, Parser)]
#[command(version, about = "Polls configured sources and serves their state")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "hearthd.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Load configuration
    let config = Config::from_file(&args.config)?;

    // Initialize tracing/logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(config.logging.filter())
        .init();

    tracing::info!("hearthd-coordinator starting");
    tracing::info!("Loaded config from: {}", args.config.display());

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();

    // Entries are set up in the background; a source that isn't ready yet is
    // retried and published once it comes up
    let entries = Arc::new(Entries::new());
    let mut setups = JoinSet::new();
    for (entry_id, entry_config) in &config.entries {
        if !entry_config.enabled {
            tracing::info!("Entry {} is disabled, skipping", entry_id);
            continue;
        }

        tracing::info!(
            "[{}] Starting entry (source: {})",
            entry_id,
            entry_config.source.kind()
        );

        let entry_id = entry_id.clone();
        let entry_config = entry_config.clone();
        let entries = entries.clone();
        let events_tx = events_tx.clone();
        setups.spawn(async move {
            match sources::setup_entry_with_retry(&entry_id, &entry_config, events_tx).await {
                Ok(entry) => {
                    entries.insert(entry);
                    tracing::info!("[{}] Entry running", entry_id);
                }
                Err(e) => tracing::error!("[{}] {:#}", entry_id, e),
            }
        });
    }
    drop(events_tx);

    let api = match &config.api {
        Some(api_config) if api_config.enabled => Some(api::ApiServer::spawn(
            api_config.listen.clone(),
            api_config.port,
            entries.clone(),
        )),
        _ => None,
    };

    tracing::info!("{} entries starting, entering main loop", setups.len());
    tracing::info!("Press Ctrl+C to exit");

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                match result {
                    Ok(()) => tracing::info!("Received shutdown signal"),
                    Err(e) => tracing::error!("Failed to listen for shutdown signal: {}", e),
                }
                break;
            }
            Some(event) = events_rx.recv() => match event {
                EntryEvent::ReauthRequired { entry_id, error } => {
                    tracing::warn!("[{}] Re-authentication required: {}", entry_id, error);
                }
            },
            Some(result) = setups.join_next() => {
                if let Err(e) = result {
                    tracing::error!("Entry setup task failed: {}", e);
                }
            }
        }
    }

    // Entries still waiting to come up are abandoned
    setups.shutdown().await;

    if let Some(api) = api {
        // Failures were logged when they happened
        api.shutdown().await.ok();
    }

    tracing::info!("Unloading entries...");
    entries.unload_all();

    tracing::info!("hearthd-coordinator shutdown complete");

    Ok(())
}
