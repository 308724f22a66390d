//! Box office sync daemon
//!
//! Runs the weekly box office sync on its cron schedule until interrupted.

use std::sync::Arc;

use anyhow::Context;

use boxoffice_sync::config::{Config, SettingsHandle};
use boxoffice_sync::jobs::{BoxOfficeScheduler, Orchestrator};
use boxoffice_sync::services::logging::init_tracing;
use boxoffice_sync::services::rate_limiter::RetryConfig;
use boxoffice_sync::services::{LibraryClient, RadarrClient, SnapshotStore, TraktClient};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    init_tracing(config.log_json);
    tracing::info!("Starting box office sync");

    let retry_config = RetryConfig {
        max_rate_limit_wait: config.max_rate_limit_wait,
        ..Default::default()
    };
    let trakt = TraktClient::new(&config.trakt_api_url, config.trakt_client_id.clone(), retry_config)
        .context("Failed to build Trakt client")?;
    let radarr = RadarrClient::new(&config.radarr_url, config.radarr_api_key.clone())
        .context("Failed to build Radarr client")?;
    let library = LibraryClient::new(Arc::new(radarr), config.library_cache_ttl);

    tokio::fs::create_dir_all(&config.data_dir)
        .await
        .with_context(|| format!("Failed to create data directory {}", config.data_dir.display()))?;
    let store = SnapshotStore::new(&config.data_dir);
    tracing::info!(path = %config.data_dir.display(), "Snapshot store ready");

    let settings = SettingsHandle::new(config.settings.clone());
    let orchestrator = Orchestrator::new(Arc::new(trakt), Arc::new(library), store, settings.clone())
        .with_retention(config.snapshot_retention_weeks)
        .with_history_capacity(config.run_history_capacity);

    let scheduler = BoxOfficeScheduler::new(Arc::new(orchestrator), settings).await?;
    match scheduler.start().await? {
        Some(next) => tracing::info!(next_run = %next, "Scheduler started"),
        None => tracing::info!("Scheduler started with the weekly sync disabled"),
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");
    scheduler.shutdown().await?;

    Ok(())
}
