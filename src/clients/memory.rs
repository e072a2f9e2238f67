use std::collections::{BTreeSet, HashMap};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::{
    models::{
        lock::LockRecord,
        notification::{NewQueuedNotification, QueuedNotification},
    },
    store::{HoldingStore, LockStore},
};

/// Holding table and lock table kept in process memory.
///
/// Locks taken here only exclude tasks inside this process, so this store is
/// for single-server deployments and tests.
#[derive(Default)]
pub struct MemoryStore {
    queued: Mutex<Vec<QueuedNotification>>,
    locks: Mutex<HashMap<String, LockRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn queued(&self) -> Vec<QueuedNotification> {
        self.queued.lock().await.clone()
    }

    pub async fn lock_record(&self, name: &str) -> Option<LockRecord> {
        self.locks.lock().await.get(name).cloned()
    }
}

#[async_trait]
impl HoldingStore for MemoryStore {
    async fn save(&self, notification: NewQueuedNotification) -> Result<QueuedNotification> {
        let queued = notification.into_queued();
        self.queued.lock().await.push(queued.clone());

        debug!(id = %queued.id, lock_name = %queued.lock_name, "Notification held in memory");

        Ok(queued)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<QueuedNotification>> {
        Ok(self
            .queued
            .lock()
            .await
            .iter()
            .find(|n| n.id == id)
            .cloned())
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        self.queued.lock().await.retain(|n| n.id != id);
        Ok(())
    }

    async fn queued_lock_names(&self) -> Result<Vec<String>> {
        let names: BTreeSet<String> = self
            .queued
            .lock()
            .await
            .iter()
            .map(|n| n.lock_name.clone())
            .collect();

        Ok(names.into_iter().collect())
    }

    async fn queued_ids_by_lock(&self, lock_name: &str) -> Result<Vec<Uuid>> {
        // Insertion order is creation order.
        Ok(self
            .queued
            .lock()
            .await
            .iter()
            .filter(|n| n.lock_name == lock_name)
            .map(|n| n.id)
            .collect())
    }

    async fn pending_count(&self) -> Result<u64> {
        Ok(self.queued.lock().await.len() as u64)
    }
}

#[async_trait]
impl LockStore for MemoryStore {
    async fn obtain_lock(&self, name: &str, holder: &str, ttl: Duration) -> Result<bool> {
        let now = Utc::now();
        let mut locks = self.locks.lock().await;

        if let Some(existing) = locks.get(name) {
            if !existing.is_expired_at(now) && existing.holder != holder {
                return Ok(false);
            }
        }

        locks.insert(
            name.to_string(),
            LockRecord {
                name: name.to_string(),
                holder: holder.to_string(),
                expires_at: now + ttl,
            },
        );

        Ok(true)
    }

    async fn release_lock(&self, name: &str, holder: &str) -> Result<bool> {
        let mut locks = self.locks.lock().await;

        match locks.get(name) {
            Some(existing) if existing.holder == holder => {
                locks.remove(name);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn locks_for_holder(&self, prefix: &str, holder: &str) -> Result<Vec<LockRecord>> {
        let mut held: Vec<LockRecord> = self
            .locks
            .lock()
            .await
            .values()
            .filter(|l| l.name.starts_with(prefix) && l.holder == holder)
            .cloned()
            .collect();
        held.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(held)
    }
}
