//! Bulkcast - Campaign dispatch server entry point

use anyhow::{bail, Result};
use bulkcast_common::config::{ChannelConfig, Config, DatabaseConfig, LoggingConfig};
use bulkcast_core::{
    CampaignEngine, ChannelAdapter, HttpChannelAdapter, LogChannelAdapter, RateLimitedChannel,
};
use bulkcast_storage::repository::{
    CampaignRepository, MemoryCampaignRepository, PgCampaignRepository,
};
use bulkcast_storage::DatabasePool;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    init_logging(&config.logging);

    info!("Starting bulkcast dispatch server...");

    let repository = init_repository(&config.database).await?;
    let channel = init_channel(&config.channel)?;

    let engine = Arc::new(CampaignEngine::new(
        repository,
        channel,
        config.dispatch.clone(),
    )?);

    // Pick up campaigns left unfinished by a previous run
    let restored = engine.restore().await?;
    info!(restored, "Campaign restore completed");

    // Start API server
    let bind = format!("{}:{}", config.api.bind_address, config.api.port);
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    let api_handle = {
        let app = bulkcast_api::create_router(engine.clone());
        info!("Starting API server on {}", bind);
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                error!("API server error: {}", e);
            }
        })
    };

    info!("Bulkcast server started successfully");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    api_handle.abort();

    info!("Bulkcast server shutdown complete");

    Ok(())
}

fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.level));

    let registry = tracing_subscriber::registry().with(filter);
    if config.format == "json" {
        registry.with(fmt::layer().json().with_target(true)).init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_level(true))
            .init();
    }
}

async fn init_repository(config: &DatabaseConfig) -> Result<Arc<dyn CampaignRepository>> {
    match config.backend.as_str() {
        "memory" => {
            warn!("Using in-memory storage; campaigns do not survive a restart");
            Ok(Arc::new(MemoryCampaignRepository::new()))
        }
        "postgres" => {
            let db_pool = DatabasePool::new(config).await?;
            db_pool.migrate().await?;
            info!("Database migrations completed");
            Ok(Arc::new(PgCampaignRepository::new(db_pool)))
        }
        other => bail!("Unknown database backend: {}", other),
    }
}

fn init_channel(config: &ChannelConfig) -> Result<Arc<dyn ChannelAdapter>> {
    let channel: Arc<dyn ChannelAdapter> = match config.backend.as_str() {
        "log" => Arc::new(LogChannelAdapter::new()),
        "http" => Arc::new(HttpChannelAdapter::from_config(config)?),
        other => bail!("Unknown channel backend: {}", other),
    };
    info!(channel = channel.name(), "Channel adapter ready");

    Ok(match config.rate_limit_per_minute {
        Some(per_minute) => {
            info!(per_minute, "Channel rate limit enabled");
            Arc::new(RateLimitedChannel::new(channel, per_minute))
        }
        None => channel,
    })
}
