//! # Pointgraph Server
//!
//! Runs the node/edge store on an MQTT broker.
//!
//! The server answers point updates and queries on the `points`, `nodes`,
//! `auth` and `admin` subjects and re-publishes every accepted update on the
//! `upstream` subjects of all ancestors.

use anyhow::{Context, Result};
use pointgraph_server::{
    runtime, MemoryStore, MqttBus, Persistence, ServerConfig, SqliteStore, Store, StoreType,
};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting pointgraph server"
    );

    let config = ServerConfig::from_env()?;

    let db: Box<dyn Persistence> = match config.store_type {
        StoreType::Sqlite => Box::new(
            SqliteStore::open(&config.db_path).context("Failed to open SQLite database")?,
        ),
        StoreType::Memory => Box::new(MemoryStore::new()),
    };
    let store = Arc::new(Store::open(db, config.hash_mode).context("Failed to load store")?);
    let stats = store.stats();
    let root = store.root_id().unwrap_or_default();
    tracing::info!(
        nodes = stats.nodes,
        edges = stats.edges,
        root = %root,
        "Store opened"
    );

    let (bus, eventloop) = MqttBus::connect(&config.mqtt_broker, &config.client_id)
        .context("Failed to create MQTT bus")?;
    let server = runtime::start(store, bus, &config)
        .await
        .context("Failed to subscribe")?;

    tracing::info!("Server running, press Ctrl+C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutdown signal received");

    server.shutdown().await;
    eventloop.abort();
    Ok(())
}
