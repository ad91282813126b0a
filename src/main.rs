use anyhow::Result;
use ethers::types::Address;
use launchpad_monitor::{
    backfill::BackfillScanner,
    config::Config,
    connection::ConnectionManager,
    database::Database,
    listener::RealTimeListener,
    projector::EventProjector,
    services::PriceOracle,
};
use sqlx::postgres::PgPoolOptions;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, Level};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .init();

    // Load configuration
    let config = Arc::new(Config::from_env()?);
    info!("Configuration loaded successfully");

    // Connect to database
    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect(&config.database.url)
        .await?;
    let database = Arc::new(Database::new(pool));
    database.create_tables().await?;
    info!("Database connected and tables created");

    // Shared per-runtime state: connection cache, backoff table, price cache
    let connections = Arc::new(ConnectionManager::new(config.chains.clone()));
    let oracle = Arc::new(PriceOracle::new());
    let (event_sender, _) = broadcast::channel(1000);

    let projector = Arc::new(EventProjector::new(
        Arc::clone(&database),
        Arc::clone(&oracle),
        Arc::clone(&config),
        event_sender.clone(),
    ));

    let shutdown = Arc::new(AtomicBool::new(false));

    // One listener + one backfill scanner per configured chain,
    // fully independent tasks
    for chain in config.chains.values() {
        let curve_address: Address = match chain.curve_address.parse() {
            Ok(address) => address,
            Err(e) => {
                if chain.chain_id == config.default_chain_id {
                    return Err(anyhow::anyhow!(
                        "默认链 {} 合约地址非法: {}",
                        chain.chain_id,
                        e
                    ));
                }
                error!("❌ 链 {} 合约地址非法，已排除: {}", chain.chain_id, e);
                continue;
            }
        };

        let listener = RealTimeListener::new(
            chain.chain_id,
            curve_address,
            Arc::clone(&connections),
            Arc::clone(&projector),
            Arc::clone(&shutdown),
        );
        tokio::spawn(async move {
            listener.run().await;
        });

        let scanner = BackfillScanner::new(
            chain.chain_id,
            curve_address,
            chain.backfill_window,
            chain.start_block,
            Arc::clone(&connections),
            Arc::clone(&database),
            Arc::clone(&projector),
        );
        tokio::spawn(async move {
            scanner.run().await;
        });
    }

    info!(
        "Event intake running for {} chain(s), press Ctrl-C to stop",
        config.chains.len()
    );
    tokio::signal::ctrl_c().await?;

    info!("Shutdown signal received");
    shutdown.store(true, Ordering::Relaxed);

    Ok(())
}
