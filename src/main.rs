//! Courier event-delivery service.
//!
//! Reads platform events from a Redis stream, fans them out to subscribed
//! webhook destinations and keeps retrying failed deliveries until they
//! succeed or exhaust their attempt budget.

mod config;

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use courier_consumer::{EventConsumer, RedisStreamBroker};
use courier_core::{Clock, DeliveryRepository, InMemoryRepository, PostgresRepository, RealClock};
use courier_delivery::{DeliveryEngine, RetryScheduler};
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info, warn};

use crate::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    init_tracing(&config.rust_log);

    info!(
        database_url = config.database_url_masked().as_deref().unwrap_or("<in-memory>"),
        redis_url = %config.redis_url_masked(),
        stream = %config.redis_stream,
        group = %config.redis_group,
        consumer = %config.redis_consumer,
        "starting courier"
    );

    let (repository, pool): (Arc<dyn DeliveryRepository>, Option<sqlx::PgPool>) =
        match &config.database_url {
            Some(url) => {
                let pool = create_database_pool(url, config.database_max_connections).await?;
                let repository = PostgresRepository::new(pool.clone());
                repository.migrate().await.context("failed to prepare database schema")?;
                info!("database schema ready");
                (Arc::new(repository), Some(pool))
            },
            None => {
                warn!("no database_url configured, deliveries are kept in memory only");
                (Arc::new(InMemoryRepository::new()), None)
            },
        };

    let clock: Arc<dyn Clock> = Arc::new(RealClock::new());
    let engine = DeliveryEngine::new(repository, config.to_engine_config(), clock)
        .context("failed to build delivery engine")?;

    let broker = RedisStreamBroker::connect(config.to_redis_config())
        .await
        .context("failed to connect to redis")?;

    let scheduler = RetryScheduler::new(engine.clone(), config.to_scheduler_config()).spawn();
    let consumer =
        EventConsumer::new(Arc::new(broker), engine.clone(), config.to_consumer_config()).spawn();

    info!("courier is consuming events");

    shutdown_signal().await;
    info!("shutdown signal received, starting graceful shutdown");

    let timeout = config.shutdown_timeout();
    if let Err(e) = consumer.shutdown().await {
        error!(error = %e, "event consumer did not stop cleanly");
    }
    if let Err(e) = scheduler.shutdown(timeout).await {
        error!(error = %e, "retry scheduler did not stop cleanly");
    }
    if let Err(e) = engine.shutdown(timeout).await {
        error!(error = %e, "delivery engine did not stop cleanly");
    }

    if let Some(pool) = pool {
        pool.close().await;
        info!("database connections closed");
    }

    info!("courier shutdown complete");
    Ok(())
}

/// Installs the fmt subscriber. `RUST_LOG` wins over the configured level.
fn init_tracing(default_level: &str) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = fmt::layer().with_target(true).with_thread_ids(true).with_line_number(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
}

/// Connects to PostgreSQL, retrying while the database comes up.
async fn create_database_pool(url: &str, max_connections: u32) -> Result<sqlx::PgPool> {
    const MAX_RETRIES: u32 = 5;
    const RETRY_DELAY: Duration = Duration::from_secs(2);
    let mut retries = 0;

    loop {
        match PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect(url)
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
                return Err(e).context("failed to connect to database after retries");
            },
        }
    }
}

/// Waits for CTRL+C or SIGTERM.
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

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received CTRL+C"),
        () = terminate => info!("received SIGTERM"),
    }
}
