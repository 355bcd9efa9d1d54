//! Courier messaging service.
//!
//! Moves updates from the chat platform to the application router and
//! application replies back to the platform, through durable PostgreSQL
//! queues. Initializes all subsystems and coordinates graceful startup and
//! shutdown.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use courier_core::{Clock, RealClock, Storage};
use courier_delivery::{
    storage::{InboundStore, OutboundStore, PostgresInboundStore, PostgresOutboundStore},
    ApiClient, HttpApiClient, HttpRouter, Ingestor, Pipeline, PipelineParts,
    PostgresIdempotencyGuard, UpdatePoller,
};
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info, warn};

mod config;

use config::Settings;

const DEFAULT_LOG_FILTER: &str = "info,courier=debug";

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    info!("starting courier");

    let settings = Settings::load()?;
    info!(
        database_url = %settings.database_url_masked(),
        bot_api_url = %settings.bot_api_url,
        router_url = %settings.router_url,
        polling_enabled = settings.polling_enabled,
        "configuration loaded"
    );

    let pool = create_database_pool(&settings).await?;
    info!("database connection pool established");

    let storage = Arc::new(Storage::new(pool.clone()));
    storage.migrate().await.context("failed to apply database schema")?;
    info!("database schema ready");

    let clock: Arc<dyn Clock> = Arc::new(RealClock::new());
    let inbound_store: Arc<InboundStore> = Arc::new(PostgresInboundStore::new(storage.clone()));
    let outbound_store: Arc<OutboundStore> = Arc::new(PostgresOutboundStore::new(storage.clone()));
    let client: Arc<dyn ApiClient> =
        Arc::new(HttpApiClient::new(settings.to_api_client_config())?);
    let router = Arc::new(HttpRouter::new(settings.router_url.clone(), settings.router_timeout())?);

    let mut pipeline = Pipeline::new(
        PipelineParts {
            inbound_store: inbound_store.clone(),
            outbound_store,
            client: client.clone(),
            router,
            clock: clock.clone(),
        },
        settings.to_pipeline_config(),
    );
    pipeline.start()?;

    if settings.polling_enabled {
        let guard = Arc::new(PostgresIdempotencyGuard::new(storage.clone(), clock.clone()));
        let ingestor = Arc::new(Ingestor::new(guard, inbound_store, clock.clone()));
        let poller = UpdatePoller::new(client, ingestor, settings.to_poller_config(), clock);
        pipeline.attach_poller(poller);
    }

    match pipeline.depth().await {
        Ok(depth) => info!(inbound = depth.inbound, outbound = depth.outbound, "courier is running"),
        Err(e) => warn!(error = %e, "courier is running, queue depth unavailable"),
    }

    shutdown_signal().await;
    info!("shutdown signal received, starting graceful shutdown");

    let stats = pipeline.stats().await;
    if let Err(e) = pipeline.shutdown().await {
        error!(error = %e, "pipeline did not shut down cleanly");
    }
    info!(
        inbound_succeeded = stats.inbound.succeeded,
        inbound_failed = stats.inbound.failed,
        outbound_succeeded = stats.outbound.succeeded,
        outbound_failed = stats.outbound.failed,
        "pipeline stopped"
    );

    pool.close().await;
    info!("database connections closed");

    info!("courier shutdown complete");
    Ok(())
}

/// Initializes tracing with environment-based configuration.
fn init_tracing() {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let fmt_layer = fmt::layer().with_target(true).with_thread_ids(true).with_line_number(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
}

/// Creates the database connection pool with retry logic.
async fn create_database_pool(settings: &Settings) -> Result<sqlx::PgPool> {
    const MAX_RETRIES: u32 = 5;
    const RETRY_DELAY: Duration = Duration::from_secs(2);

    let mut retries = 0;
    loop {
        match PgPoolOptions::new()
            .max_connections(settings.database_max_connections)
            .min_connections(settings.database_min_connections)
            .acquire_timeout(Duration::from_secs(settings.database_acquire_timeout_seconds))
            .idle_timeout(Duration::from_secs(600))
            .max_lifetime(Duration::from_secs(1800))
            .connect(&settings.database_url)
            .await
        {
            Ok(pool) => {
                sqlx::query("SELECT 1")
                    .execute(&pool)
                    .await
                    .context("failed to verify database connection")?;
                return Ok(pool);
            },
            Err(e) if retries < MAX_RETRIES => {
                retries += 1;
                warn!(
                    attempt = retries,
                    max_retries = MAX_RETRIES,
                    error = %e,
                    "database connection failed, retrying"
                );
                tokio::time::sleep(RETRY_DELAY).await;
            },
            Err(e) => {
                return Err(e).context("failed to create database connection pool after retries");
            },
        }
    }
}

/// Waits for CTRL+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for CTRL+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("received CTRL+C signal");
        },
        () = terminate => {
            info!("received SIGTERM signal");
        },
    }
}
