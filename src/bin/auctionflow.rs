//! auctionflow runtime
//!
//! Loads saved state, then runs the aggregator, name resolver, and status
//! loops until CTRL+C, saving once more on the way out.
//!
//! Usage:
//!   cargo run --release --bin auctionflow
//!
//! Environment variables: see `auctionflow::config::Config::from_env`.

use auctionflow::config::{Config, StoreBackend};
use auctionflow::store::{JsonFileStore, MemoryStore, SqliteStateStore, StateStore};
use auctionflow::{
    load_initial_state, scheduler, Aggregator, HypixelFeedClient, MojangLookupClient,
    QueryFacade, Resolver,
};
use dotenv::dotenv;
use log::{error, info};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

fn open_store(config: &Config) -> Result<Arc<dyn StateStore>, Box<dyn std::error::Error>> {
    let store: Arc<dyn StateStore> = match config.backend {
        StoreBackend::Sqlite => Arc::new(SqliteStateStore::open(&config.state_path)?),
        StoreBackend::Json => Arc::new(JsonFileStore::new(&config.state_path)),
        StoreBackend::Memory => Arc::new(MemoryStore::new()),
    };
    Ok(store)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    let config = Config::from_env()?;

    info!("🚀 Starting auctionflow...");
    info!("📊 Configuration:");
    info!("   ├─ Feed: {}", config.feed_url);
    info!("   ├─ Name lookup: {}", config.lookup_url);
    info!("   ├─ State backend: {} ({})", config.backend, config.state_path);
    info!("   ├─ Tick interval: {:?}", config.tick_interval);
    info!("   ├─ Resolve interval: {:?}", config.resolve_interval);
    info!("   └─ Max name retries: {}", config.max_name_retries);

    let store = open_store(&config)?;
    let feed = Arc::new(HypixelFeedClient::new(&config.feed_url, config.request_timeout)?);
    let lookup = Arc::new(MojangLookupClient::new(&config.lookup_url, config.request_timeout)?);
    let resolver = Arc::new(Resolver::with_max_retries(lookup, config.max_name_retries));

    let (initial, version) = load_initial_state(store.as_ref(), &resolver).await;
    let state = Arc::new(RwLock::new(initial));
    let aggregator = Arc::new(Mutex::new(Aggregator::new(
        state.clone(),
        feed,
        resolver.clone(),
        store,
        version,
    )));
    info!("✅ Aggregator ready");

    let aggregator_handle = tokio::spawn(scheduler::aggregator_task(
        aggregator.clone(),
        config.tick_interval,
    ));
    let resolver_handle = tokio::spawn(scheduler::resolver_task(
        resolver.clone(),
        state.clone(),
        config.resolve_interval,
    ));
    let status_handle = tokio::spawn(scheduler::status_task(
        QueryFacade::new(state.clone()),
        resolver.clone(),
        config.status_log_interval,
    ));

    info!("🔄 Press CTRL+C to shutdown gracefully");

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("⚠️  Received CTRL+C, shutting down..."),
        Err(err) => error!("❌ Failed to listen for CTRL+C: {}", err),
    }

    aggregator_handle.abort();
    resolver_handle.abort();
    status_handle.abort();

    let persistence = aggregator.lock().await.flush().await;
    info!("💾 Final save: {:?}", persistence);

    info!("✅ auctionflow stopped");
    Ok(())
}
