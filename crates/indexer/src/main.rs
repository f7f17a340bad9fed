//! VaultBridge block indexer - the producer service.
//!
//! Tails one or more EVM chains, filters transactions against configured
//! event topics, and publishes matches to the message bus in block order.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use vaultbridge_bus::{InMemoryBus, MessagePublisher};
use vaultbridge_indexer::cache::TxCache;
use vaultbridge_indexer::client::HttpChainClient;
use vaultbridge_indexer::config::Config;
use vaultbridge_indexer::processor::BlockProcessor;
use vaultbridge_indexer::{ChainIndexer, Storage};

#[derive(Parser)]
#[command(name = "vaultbridge-indexer")]
#[command(version, about = "VaultBridge block indexer", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "indexer.toml")]
    config: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the indexer service
    Run,

    /// Show queue and progress statistics per chain
    Status,

    /// Initialize the database
    InitDb,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.debug)?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(&cli.config).await?,
        Commands::Status => show_status(&cli.config).await?,
        Commands::InitDb => init_database(&cli.config).await?,
    }

    Ok(())
}

/// Initialize tracing subscriber for logging
fn init_logging(debug: bool) -> Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let env_filter = if debug {
        EnvFilter::new("vaultbridge_indexer=debug,vaultbridge_bus=debug,sqlx=debug")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("vaultbridge_indexer=info,vaultbridge_bus=info"))
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(true).with_line_number(true))
        .init();

    Ok(())
}

/// Run the indexer service: one indexer task per configured chain.
async fn run(config_path: &str) -> Result<()> {
    info!("VaultBridge indexer starting");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_file(config_path)?;
    info!(chains = config.chains.len(), "Configuration loaded from {config_path}");

    let storage = Storage::new(
        &config.database.url,
        Some(config.database.max_connections),
        Some(config.database.min_connections),
    )
    .await?;
    storage.run_migrations().await?;

    let bus = Arc::new(InMemoryBus::with_capacity(config.bus.capacity));
    bus.connect().await.context("Failed to connect message bus")?;

    let shutdown = CancellationToken::new();
    let mut handles = Vec::new();

    for chain in config.chains {
        let chain_name = chain.name.clone();

        let client = HttpChainClient::connect(&chain.rpc_url, chain.ws_url.clone(), chain.chain_id)
            .await
            .with_context(|| format!("Failed to connect chain '{chain_name}'"))?;
        let client = Arc::new(client);

        let cache = Arc::new(TxCache::new(chain.tx_cache_size));
        let processor = BlockProcessor::new(
            client.clone(),
            cache,
            chain.name.clone(),
            chain.processor_config(),
        );

        let filters = chain.topics.iter().cloned().map(Into::into).collect();
        let indexer = ChainIndexer::new(
            client,
            bus.clone(),
            storage.clone(),
            processor,
            filters,
            chain.indexer_config(config.bus.channel.clone()),
        );

        let shutdown = shutdown.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = indexer.run(shutdown).await {
                error!(chain = %chain_name, error = %e, "Chain indexer failed");
            }
        });
        handles.push(handle);
    }

    info!("All chain indexers started. Press Ctrl+C to stop.");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    info!("Shutdown signal received, stopping all indexers");
    shutdown.cancel();

    for handle in handles {
        let _ = handle.await;
    }

    bus.disconnect().await;
    storage.close().await;
    info!("Indexer stopped gracefully");

    Ok(())
}

/// Print per-chain queue and progress statistics.
async fn show_status(config_path: &str) -> Result<()> {
    let config = Config::from_file(config_path)?;

    let storage = Storage::new(&config.database.url, None, None).await?;
    storage.run_migrations().await?;

    println!("\n=== VaultBridge Indexer Status ===\n");
    for chain in &config.chains {
        let stats = storage.stats(chain.chain_id).await?;
        println!("Chain {} ({}):", chain.name, chain.chain_id);
        println!(
            "  Latest processed: {}",
            stats
                .latest_processed
                .map(|n| n.to_string())
                .unwrap_or_else(|| "none".to_string())
        );
        println!("  Processed blocks: {}", stats.processed);
        println!(
            "  Queue: {} pending, {} processing, {} completed, {} failed, {} reorged",
            stats.pending, stats.processing, stats.completed, stats.failed, stats.reorged
        );
        println!("  Topic filters: {}", chain.topics.len());
        println!();
    }

    storage.close().await;
    Ok(())
}

/// Initialize the database and verify it is reachable.
async fn init_database(config_path: &str) -> Result<()> {
    let config = Config::from_file(config_path)?;

    info!(url = %config.database.url, "Initializing indexer database");
    let storage = Storage::new(
        &config.database.url,
        Some(config.database.max_connections),
        Some(config.database.min_connections),
    )
    .await?;

    storage.run_migrations().await?;
    storage.health_check().await?;

    info!("Database initialized successfully");
    storage.close().await;
    Ok(())
}
