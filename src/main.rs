//! Surety worker service.
//!
//! Main entry point: loads configuration, establishes the database pool,
//! bootstraps the schema, and runs one worker loop until a shutdown signal
//! arrives.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use surety_core::{storage::schema::ensure_schema, Clock, RealClock, Storage};
use surety_delivery::{Config, HttpTransport, Transport, Worker};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    info!("starting surety worker service");

    let config = Config::load().context("failed to load configuration")?;
    info!(
        database_url = %config.database_url_masked(),
        batch_size = config.batch_size,
        tick_us = config.micro_seconds_to_wait,
        "configuration loaded"
    );

    if !config.enabled {
        info!("workers are disabled by configuration, exiting");
        return Ok(());
    }

    let pool = create_database_pool(&config).await?;
    info!("database connection pool established");

    ensure_schema(&pool).await.context("failed to bootstrap schema")?;
    info!("schema bootstrap completed");

    let storage = Arc::new(Storage::new(pool.clone()));
    let transport: Arc<dyn Transport> =
        Arc::new(HttpTransport::new(config.to_transport_config())?);
    let clock: Arc<dyn Clock> = Arc::new(RealClock::new());
    let cancellation_token = CancellationToken::new();

    let worker = Arc::new(Worker::new(
        storage,
        transport,
        config.to_worker_config(),
        cancellation_token.clone(),
        clock,
    )?);
    info!(worker = worker.tag(), "worker constructed");

    let worker_handle = tokio::spawn({
        let worker = worker.clone();
        async move { worker.run().await }
    });

    shutdown_signal().await;
    info!("shutdown signal received, finishing the current cycle");

    cancellation_token.cancel();
    worker_handle.await.context("worker task panicked")?;

    pool.close().await;
    info!("database connections closed, shutdown complete");

    Ok(())
}

/// Initializes tracing with environment-based configuration.
fn init_tracing() {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info,surety=debug"))
        .expect("invalid RUST_LOG environment variable");

    let fmt_layer = fmt::layer().with_target(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
}

/// Creates the database connection pool with retry logic.
async fn create_database_pool(config: &Config) -> Result<sqlx::PgPool> {
    const MAX_RETRIES: u32 = 5;
    const RETRY_DELAY: Duration = Duration::from_secs(2);

    let mut retries = 0;

    loop {
        match PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .min_connections(1)
            .acquire_timeout(Duration::from_secs(10))
            .connect(&config.database_url)
            .await
        {
            Ok(pool) => {
                sqlx::query("SELECT 1")
                    .fetch_one(&pool)
                    .await
                    .context("failed to verify database connection")?;

                return Ok(pool);
            },
            Err(_e) if retries < MAX_RETRIES => {
                retries += 1;
                info!(
                    attempt = retries,
                    max_retries = MAX_RETRIES,
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

/// Waits for a shutdown signal (SIGTERM, SIGQUIT, or Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(unix)]
    let quit = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::quit())
            .expect("failed to install SIGQUIT handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    #[cfg(not(unix))]
    let quit = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C"),
        _ = terminate => info!("received SIGTERM"),
        _ = quit => info!("received SIGQUIT"),
    }
}
