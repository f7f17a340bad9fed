//! VaultBridge consumer - ownership commitments and the collateral ledger.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use alloy::signers::local::PrivateKeySigner;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;

use vaultbridge_bus::{InMemoryBus, MessagePublisher};
use vaultbridge_consumer::config::Config;
use vaultbridge_consumer::relayer::{OnChainLendingPool, OnChainRelayerClient};
use vaultbridge_consumer::service::ConsumerService;
use vaultbridge_consumer::{CachedOracle, Ledger, MerkleEngine, StaticPriceOracle, Storage};

/// TTL for cached oracle prices.
const PRICE_CACHE_TTL: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "vaultbridge-consumer")]
#[command(version, about = "VaultBridge ownership and collateral consumer", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "consumer.toml")]
    config: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the consumer service
    Run,

    /// Show ledger and ownership statistics
    Status,

    /// Initialize the database
    InitDb,

    /// Re-validate all pending collateral requests once
    SweepPending,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.debug)?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(&cli.config).await?,
        Commands::Status => show_status(&cli.config).await?,
        Commands::InitDb => init_database(&cli.config).await?,
        Commands::SweepPending => sweep_pending(&cli.config).await?,
    }

    Ok(())
}

/// Initialize tracing subscriber for logging
fn init_logging(debug: bool) -> Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let env_filter = if debug {
        EnvFilter::new("vaultbridge_consumer=debug,vaultbridge_bus=debug,sqlx=debug")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("vaultbridge_consumer=info,vaultbridge_bus=info"))
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(true).with_line_number(true))
        .init();

    Ok(())
}

/// Build the fully wired ledger stack from configuration.
async fn build_ledger(config: &Config) -> Result<(Storage, Arc<MerkleEngine>, Arc<Ledger>)> {
    let storage = Storage::new(
        &config.database.url,
        Some(config.database.max_connections),
        Some(config.database.min_connections),
    )
    .await?;
    storage.run_migrations().await?;

    let signer: PrivateKeySigner = config
        .signer
        .private_key_with_prefix()
        .parse()
        .context("Invalid signer private key")?;

    let relayer = Arc::new(
        OnChainRelayerClient::connect(&config.relayers, signer.clone())
            .context("Failed to connect relayer client")?,
    );
    let lending = Arc::new(
        OnChainLendingPool::connect(&config.relayers, signer)
            .context("Failed to connect lending pool client")?,
    );

    let merkle = Arc::new(MerkleEngine::new(
        storage.clone(),
        relayer.clone(),
        config.relayer_chain_ids(),
    ));
    merkle.initialize().await?;

    let oracle = Arc::new(CachedOracle::new(
        StaticPriceOracle::new(config.asset_table()),
        PRICE_CACHE_TTL,
    ));

    let vault_handlers: HashMap<u64, _> = config
        .relayers
        .iter()
        .map(|r| (r.chain_id, r.vault_handler))
        .collect();

    let ledger = Arc::new(Ledger::new(
        storage.clone(),
        merkle.clone(),
        oracle,
        relayer,
        lending,
        config.asset_table(),
        vault_handlers,
        false,
    ));

    Ok((storage, merkle, ledger))
}

/// Run the consumer service.
async fn run(config_path: &str) -> Result<()> {
    info!("VaultBridge consumer starting");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_file(config_path)?;
    let (storage, _merkle, ledger) = build_ledger(&config).await?;

    // One startup pass over anything a previous run left pending
    let swept = ledger.sweep_pending_requests().await?;
    if swept > 0 {
        info!(swept, "Re-validated pending collateral requests at startup");
    }

    let bus = Arc::new(InMemoryBus::with_capacity(config.bus.capacity));
    bus.connect().await.context("Failed to connect message bus")?;

    let shutdown = CancellationToken::new();
    let service = ConsumerService::new(bus.clone(), config.bus.channel.clone(), ledger);

    let service_shutdown = shutdown.clone();
    let handle = tokio::spawn(async move { service.run(service_shutdown).await });

    info!("Consumer running. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    info!("Shutdown signal received");
    shutdown.cancel();

    let _ = handle.await;
    bus.disconnect().await;
    storage.close().await;
    info!("Consumer stopped gracefully");

    Ok(())
}

/// Print ledger and ownership statistics.
async fn show_status(config_path: &str) -> Result<()> {
    let config = Config::from_file(config_path)?;

    let storage = Storage::new(&config.database.url, None, None).await?;
    storage.run_migrations().await?;

    let stats = storage.stats().await?;
    let latest = storage.latest_committed_transfer().await?;

    println!("\n=== VaultBridge Consumer Status ===\n");
    println!("Ownership:");
    println!("  NFT transfers: {}", stats.transfers);
    match latest {
        Some(transfer) => {
            println!(
                "  Latest committed root: {}",
                transfer
                    .merkle_root
                    .map(|r| r.to_string())
                    .unwrap_or_else(|| "none".to_string())
            );
            println!("  Committed through block: {}", transfer.block_number);
        }
        None => println!("  No root committed yet."),
    }

    println!("\nLedger:");
    println!("  Users: {}", stats.users);
    println!("  Deposits: {}", stats.deposits);
    println!("  Withdrawals: {}", stats.withdrawals);
    println!("  Active borrows: {}", stats.active_borrows);
    println!("  Pending collateral requests: {}", stats.pending_requests);
    println!();

    storage.close().await;
    Ok(())
}

/// Initialize the database and verify it is reachable.
async fn init_database(config_path: &str) -> Result<()> {
    let config = Config::from_file(config_path)?;

    info!(url = %config.database.url, "Initializing consumer database");
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

/// One manual pass over pending collateral requests.
async fn sweep_pending(config_path: &str) -> Result<()> {
    let config = Config::from_file(config_path)?;
    let (storage, _merkle, ledger) = build_ledger(&config).await?;

    let swept = ledger.sweep_pending_requests().await?;
    info!(swept, "Pending collateral requests re-validated");

    storage.close().await;
    Ok(())
}
