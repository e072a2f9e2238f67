use std::{collections::BTreeMap, sync::Arc, time::Instant};

use anyhow::Result;
use chrono::Utc;
use tracing::{debug, warn};

use crate::{
    clients::{database::DatabaseClient, redis::RedisLockStore},
    lock::LockManager,
    models::health::{ComponentHealth, HealthCheckResponse, HealthStatus, QueueHealth},
    store::HoldingStore,
};

/// Probes the stores this server dispatches from.
pub struct HealthChecker {
    database: Option<Arc<DatabaseClient>>,
    redis: Option<Arc<RedisLockStore>>,
    holding: Arc<dyn HoldingStore>,
    locks: Arc<LockManager>,
}

impl HealthChecker {
    pub fn new(
        database: Option<Arc<DatabaseClient>>,
        redis: Option<Arc<RedisLockStore>>,
        holding: Arc<dyn HoldingStore>,
        locks: Arc<LockManager>,
    ) -> Self {
        Self {
            database,
            redis,
            holding,
            locks,
        }
    }

    pub async fn check_all(&self) -> HealthCheckResponse {
        let mut components = BTreeMap::new();

        let database = match &self.database {
            Some(database) => timed("database", database.health_check()).await,
            None => ComponentHealth::limited("in-memory holding store, not shared"),
        };
        components.insert("database".to_string(), database);

        if let Some(redis) = &self.redis {
            components.insert("lock_store".to_string(), timed("redis", redis.health_check()).await);
        }

        let mut queue = QueueHealth::default();

        match self.holding.pending_count().await {
            Ok(count) => queue.pending_notifications = Some(count),
            Err(e) => {
                warn!(error = %e, "Failed to count queued notifications");
                components.insert(
                    "holding_store".to_string(),
                    ComponentHealth::down(format!("count failed: {}", e)),
                );
            }
        }

        match self.locks.held_locks().await {
            Ok(locks) => queue.held_locks = locks.into_iter().map(|l| l.name).collect(),
            Err(e) => warn!(error = %e, "Failed to list held locks"),
        }

        HealthCheckResponse {
            status: overall_status(&components),
            timestamp: Utc::now(),
            server_id: self.locks.holder().to_string(),
            components,
            queue,
        }
    }
}

async fn timed(component: &str, probe: impl Future<Output = Result<()>>) -> ComponentHealth {
    let start = Instant::now();

    match probe.await {
        Ok(()) => {
            let elapsed = start.elapsed().as_millis() as u64;
            debug!(component, latency_ms = elapsed, "Health probe passed");
            ComponentHealth::up(elapsed)
        }
        Err(e) => {
            warn!(component, error = %e, "Health probe failed");
            ComponentHealth::down(e.to_string())
        }
    }
}

// Worst component wins.
fn overall_status(components: &BTreeMap<String, ComponentHealth>) -> HealthStatus {
    components
        .values()
        .map(|c| c.status)
        .max()
        .unwrap_or(HealthStatus::Healthy)
}
