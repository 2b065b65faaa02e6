//! Relay process entrypoint.
//!
//! Loads configuration, connects PostgreSQL and Redis, optionally runs
//! migrations, then starts the lock-gated relay supervisor and waits for
//! ctrl-c.

use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use event_relay::adapters::{PostgresOutboxStore, RedisLockManager, RedisStreamBus};
use event_relay::application::{
    purge_published, RelayProcessor, RelayProcessorConfig, RelaySupervisor,
};
use event_relay::config::AppConfig;
use event_relay::ports::{LockManager, OutboxStore, StreamPublisher};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = AppConfig::load()?;
    config.validate()?;

    let pool = PgPoolOptions::new()
        .min_connections(config.database.min_connections)
        .max_connections(config.database.max_connections)
        .acquire_timeout(config.database.acquire_timeout())
        .idle_timeout(config.database.idle_timeout())
        .connect(&config.database.url)
        .await?;
    tracing::info!("connected to PostgreSQL");

    if config.database.run_migrations {
        sqlx::migrate!("./migrations").run(&pool).await?;
        tracing::info!("migrations applied");
    }

    let redis_client = redis::Client::open(config.redis.url.as_str())?;
    let bus = RedisStreamBus::connect(redis_client.clone()).await?;
    let lock = RedisLockManager::connect(redis_client, "relay:lock").await?;
    tracing::info!("connected to Redis");

    let store: Arc<dyn OutboxStore> = Arc::new(PostgresOutboxStore::new(pool));
    let bus: Arc<dyn StreamPublisher> = Arc::new(bus);
    let lock: Arc<dyn LockManager> = Arc::new(lock);

    let processor_config = RelayProcessorConfig::default()
        .with_poll_interval(config.relay.poll_interval())
        .with_batch_size(config.relay.batch_size)
        .with_max_retries(config.relay.max_retries);
    let processor = Arc::new(RelayProcessor::with_config(
        store.clone(),
        bus,
        processor_config,
    ));

    let supervisor = RelaySupervisor::new(
        lock.clone(),
        processor,
        config.relay.lock_key.clone(),
        config.relay.lock_ttl(),
        config.relay.standby_interval(),
    );
    let handle = supervisor.start();
    tracing::info!(lock_key = %config.relay.lock_key, "relay supervisor started");

    // Hourly retention sweep, single-flight across instances via the lock.
    let sweep = {
        let store = store.clone();
        let lock = lock.clone();
        let lock_ttl = config.relay.lock_ttl();
        let retention_hours = config.relay.retention_hours;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(3600));
            loop {
                ticker.tick().await;
                if let Err(e) =
                    purge_published(store.as_ref(), lock.as_ref(), lock_ttl, retention_hours).await
                {
                    tracing::warn!(error = %e, "outbox retention sweep failed");
                }
            }
        })
    };

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");
    sweep.abort();
    handle.shutdown().await;
    tracing::info!("relay stopped");

    Ok(())
}
