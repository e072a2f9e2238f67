use anyhow::Result;
use async_trait::async_trait;
use chrono::Duration;
use uuid::Uuid;

use crate::models::{
    lock::LockRecord,
    notification::{NewQueuedNotification, QueuedNotification},
};

/// Durable table of notifications waiting to be dispatched.
#[async_trait]
pub trait HoldingStore: Send + Sync {
    /// Persist a notification and return it with its assigned id.
    async fn save(&self, notification: NewQueuedNotification) -> Result<QueuedNotification>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<QueuedNotification>>;

    /// Remove a notification. Deleting an id that is already gone is not an error.
    async fn delete(&self, id: Uuid) -> Result<()>;

    /// Distinct lock names that currently have queued notifications.
    async fn queued_lock_names(&self) -> Result<Vec<String>>;

    /// Ids queued under `lock_name`, oldest first.
    async fn queued_ids_by_lock(&self, lock_name: &str) -> Result<Vec<Uuid>>;

    async fn pending_count(&self) -> Result<u64>;
}

/// Named, time-bounded exclusive locks shared by every server instance.
///
/// Implementations must make `obtain_lock` a single atomic conditional write
/// on the shared store.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Take `name` for `holder` until `ttl` from now. Succeeds when the lock is
    /// free, expired, or already held by `holder` (which refreshes it).
    async fn obtain_lock(&self, name: &str, holder: &str, ttl: Duration) -> Result<bool>;

    /// Drop `name` if `holder` owns it. Returns whether a record was removed.
    async fn release_lock(&self, name: &str, holder: &str) -> Result<bool>;

    /// Every lock under `prefix` recorded for `holder`, expired or not.
    async fn locks_for_holder(&self, prefix: &str, holder: &str) -> Result<Vec<LockRecord>>;
}
