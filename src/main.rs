use std::sync::Arc;

use anyhow::{Error, Result};
use eval_notifier::{
    api::run_api_server,
    clients::{
        database::DatabaseClient,
        events::{EventSink, HttpEventSink, LogEventSink},
        health::HealthChecker,
        mail::{LogTransport, MailTransport, SmtpMailer},
        memory::MemoryStore,
        redis::RedisLockStore,
    },
    config::Config,
    dispatcher::{Dispatcher, spawn_dispatch_loop},
    lock::LockManager,
    models::delivery::DeliveryMode,
    store::{HoldingStore, LockStore},
};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Error> {
    let config = Arc::new(Config::load()?);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        server_id = %config.server_id,
        delivery_mode = %config.email_delivery_option,
        "Configuration validated"
    );

    let (database, holding, mut lock_store): (
        Option<Arc<DatabaseClient>>,
        Arc<dyn HoldingStore>,
        Arc<dyn LockStore>,
    ) = match &config.database_url {
        Some(url) => {
            let client = Arc::new(DatabaseClient::connect(url).await?);
            client.migrate().await?;
            let holding: Arc<dyn HoldingStore> = client.clone();
            let lock_store: Arc<dyn LockStore> = client.clone();
            (Some(client), holding, lock_store)
        }
        None => {
            warn!("DATABASE_URL not set, queued notifications live in memory only");
            let store = Arc::new(MemoryStore::new());
            let holding: Arc<dyn HoldingStore> = store.clone();
            let lock_store: Arc<dyn LockStore> = store;
            (None, holding, lock_store)
        }
    };

    let redis = match &config.redis_url {
        Some(url) => {
            let store = Arc::new(RedisLockStore::connect(url).await?);
            let shared: Arc<dyn LockStore> = store.clone();
            lock_store = shared;
            info!("Partition locks are kept in redis");
            Some(store)
        }
        None => None,
    };

    let locks = Arc::new(LockManager::new(
        lock_store,
        config.email_lock_prefix.clone(),
        config.server_id.clone(),
        config.lock_ttl(),
    ));

    let released = locks.release_own_locks().await?;
    info!(released, "Startup lock recovery finished");

    let transport: Arc<dyn MailTransport> =
        if config.email_delivery_option == DeliveryMode::Send || config.smtp_host.is_some() {
            Arc::new(SmtpMailer::new(&config)?)
        } else {
            Arc::new(LogTransport)
        };

    let events: Arc<dyn EventSink> = match &config.event_sink_url {
        Some(url) => Arc::new(HttpEventSink::new(url, &config)?),
        None => Arc::new(LogEventSink),
    };

    let health_checker = HealthChecker::new(database, redis, holding.clone(), locks.clone());
    let port = config.server_port;
    tokio::spawn(async move {
        if let Err(e) = run_api_server(health_checker, port).await {
            error!(error = %e, "Health check server stopped");
        }
    });

    let dispatcher = Arc::new(Dispatcher::new(holding, locks, transport, events));

    info!("Dispatcher is ready to start");
    spawn_dispatch_loop(dispatcher, config).await;

    Ok(())
}
