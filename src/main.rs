//! mailsync - Entry point for the synchronization engine

use std::sync::Arc;

use anyhow::{Context, Result};
use mailsync::config::Settings;
use mailsync::providers::DefaultAdapterFactory;
use mailsync::services::{EngineConfig, SyncService, SystemClock};
use mailsync::storage::StorageLayer;

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    tracing::info!("Starting mailsync");

    if let Err(e) = run().await {
        tracing::error!("Engine error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let settings = Settings::load().context("loading settings")?;

    let db_path = settings.database_path()?;
    let storage = StorageLayer::new(&db_path, settings.vault.keychain_service.clone())
        .await
        .with_context(|| format!("opening database at {}", db_path.display()))?;
    tracing::info!(path = %db_path.display(), "Database opened");

    let vault = storage
        .unlock_vault(settings.vault.key.as_deref())
        .await
        .context("unlocking credential vault")?;

    let http = reqwest::Client::new();
    let config: EngineConfig = settings.engine_config();
    let engine = SyncService::new(
        storage.repository(),
        Arc::new(vault),
        Arc::new(settings.token_client(http)),
        Arc::new(DefaultAdapterFactory::new(settings.adapter_options())),
        Arc::new(SystemClock),
        config,
    );

    engine.start().await?;
    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    tracing::info!("Shutdown requested");
    engine.shutdown().await?;
    Ok(())
}
