use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio_postgres::{Client, NoTls, Row};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::{
    models::{
        lock::LockRecord,
        notification::{NewQueuedNotification, QueuedNotification},
    },
    store::{HoldingStore, LockStore},
};

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS queued_notifications (
        id UUID PRIMARY KEY,
        lock_name TEXT NOT NULL,
        to_address TEXT NOT NULL,
        subject TEXT NOT NULL,
        body TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL
    );
    CREATE INDEX IF NOT EXISTS queued_notifications_lock_name_idx
        ON queued_notifications (lock_name, created_at);
    CREATE TABLE IF NOT EXISTS notification_locks (
        name TEXT PRIMARY KEY,
        holder TEXT NOT NULL,
        expires_at TIMESTAMPTZ NOT NULL
    );
"#;

/// PostgreSQL-backed holding table and lock table.
pub struct DatabaseClient {
    client: Client,
}

impl DatabaseClient {
    pub async fn connect(database_url: &str) -> Result<Self, Error> {
        info!("Connecting to PostgreSQL database");

        let (client, connection) = tokio_postgres::connect(database_url, NoTls)
            .await
            .map_err(|e| anyhow!("Failed to connect to database: {}", e))?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!(error = %e, "PostgreSQL connection closed with error");
            }
        });

        info!("PostgreSQL connection established");

        Ok(Self { client })
    }

    pub async fn migrate(&self) -> Result<(), Error> {
        self.client
            .batch_execute(SCHEMA)
            .await
            .map_err(|e| anyhow!("Failed to apply schema: {}", e))?;

        debug!("Notification schema is up to date");

        Ok(())
    }

    pub async fn health_check(&self) -> Result<(), Error> {
        self.client
            .query_one("SELECT 1", &[])
            .await
            .map_err(|e| anyhow!("Database health check failed: {}", e))?;

        Ok(())
    }

    fn notification_from_row(row: &Row) -> QueuedNotification {
        QueuedNotification {
            id: row.get("id"),
            lock_name: row.get("lock_name"),
            to_address: row.get("to_address"),
            subject: row.get("subject"),
            body: row.get("body"),
            created_at: row.get("created_at"),
        }
    }
}

#[async_trait]
impl HoldingStore for DatabaseClient {
    async fn save(&self, notification: NewQueuedNotification) -> Result<QueuedNotification> {
        let queued = notification.into_queued();

        self.client
            .execute(
                r#"
                INSERT INTO queued_notifications (
                    id,
                    lock_name,
                    to_address,
                    subject,
                    body,
                    created_at
                )
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
                &[
                    &queued.id,
                    &queued.lock_name,
                    &queued.to_address,
                    &queued.subject,
                    &queued.body,
                    &queued.created_at,
                ],
            )
            .await
            .map_err(|e| {
                error!(error = %e, lock_name = %queued.lock_name, "Failed to queue notification");
                anyhow!("Database write failed: {}", e)
            })?;

        debug!(id = %queued.id, lock_name = %queued.lock_name, "Notification saved to the holding table");

        Ok(queued)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<QueuedNotification>> {
        let row = self
            .client
            .query_opt(
                "SELECT id, lock_name, to_address, subject, body, created_at \
                 FROM queued_notifications WHERE id = $1",
                &[&id],
            )
            .await
            .map_err(|e| anyhow!("Failed to read queued notification {}: {}", id, e))?;

        Ok(row.as_ref().map(Self::notification_from_row))
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        self.client
            .execute("DELETE FROM queued_notifications WHERE id = $1", &[&id])
            .await
            .map_err(|e| anyhow!("Failed to delete queued notification {}: {}", id, e))?;

        Ok(())
    }

    async fn queued_lock_names(&self) -> Result<Vec<String>> {
        let rows = self
            .client
            .query(
                "SELECT DISTINCT lock_name FROM queued_notifications ORDER BY lock_name",
                &[],
            )
            .await
            .map_err(|e| anyhow!("Failed to list queued lock names: {}", e))?;

        Ok(rows.iter().map(|row| row.get(0)).collect())
    }

    async fn queued_ids_by_lock(&self, lock_name: &str) -> Result<Vec<Uuid>> {
        let rows = self
            .client
            .query(
                "SELECT id FROM queued_notifications WHERE lock_name = $1 \
                 ORDER BY created_at, id",
                &[&lock_name],
            )
            .await
            .map_err(|e| anyhow!("Failed to claim notifications for {}: {}", lock_name, e))?;

        Ok(rows.iter().map(|row| row.get(0)).collect())
    }

    async fn pending_count(&self) -> Result<u64> {
        let row = self
            .client
            .query_one("SELECT COUNT(*) FROM queued_notifications", &[])
            .await
            .map_err(|e| anyhow!("Failed to count queued notifications: {}", e))?;

        let count: i64 = row.get(0);
        Ok(count.max(0) as u64)
    }
}

#[async_trait]
impl LockStore for DatabaseClient {
    async fn obtain_lock(&self, name: &str, holder: &str, ttl: Duration) -> Result<bool> {
        let ttl_seconds = ttl.num_milliseconds() as f64 / 1000.0;

        // The conflict branch only fires for an expired lock or our own, so the
        // row count tells us whether we hold it now.
        let affected = self
            .client
            .execute(
                r#"
                INSERT INTO notification_locks (name, holder, expires_at)
                VALUES ($1, $2, now() + make_interval(secs => $3))
                ON CONFLICT (name) DO UPDATE
                SET holder = EXCLUDED.holder, expires_at = EXCLUDED.expires_at
                WHERE notification_locks.expires_at <= now()
                   OR notification_locks.holder = EXCLUDED.holder
                "#,
                &[&name, &holder, &ttl_seconds],
            )
            .await
            .map_err(|e| anyhow!("Failed to obtain lock {}: {}", name, e))?;

        Ok(affected == 1)
    }

    async fn release_lock(&self, name: &str, holder: &str) -> Result<bool> {
        let affected = self
            .client
            .execute(
                "DELETE FROM notification_locks WHERE name = $1 AND holder = $2",
                &[&name, &holder],
            )
            .await
            .map_err(|e| anyhow!("Failed to release lock {}: {}", name, e))?;

        Ok(affected > 0)
    }

    async fn locks_for_holder(&self, prefix: &str, holder: &str) -> Result<Vec<LockRecord>> {
        let escaped = prefix
            .replace('\\', "\\\\")
            .replace('%', "\\%")
            .replace('_', "\\_");
        let pattern = format!("{}%", escaped);

        let rows = self
            .client
            .query(
                "SELECT name, holder, expires_at FROM notification_locks \
                 WHERE name LIKE $1 AND holder = $2 ORDER BY name",
                &[&pattern, &holder],
            )
            .await
            .map_err(|e| anyhow!("Failed to list locks for {}: {}", holder, e))?;

        Ok(rows
            .iter()
            .map(|row| {
                let expires_at: DateTime<Utc> = row.get("expires_at");
                LockRecord {
                    name: row.get("name"),
                    holder: row.get("holder"),
                    expires_at,
                }
            })
            .collect())
    }
}
