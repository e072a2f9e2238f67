use std::sync::Arc;

use anyhow::Result;
use chrono::Duration;
use tracing::{debug, info};

use crate::{models::lock::LockRecord, store::LockStore};

/// Partition locks for one server identity.
///
/// Partitions are named `prefix + index`. Builders scatter new notifications
/// over the partitions at random; the dispatcher of each server claims one
/// partition per run.
pub struct LockManager {
    store: Arc<dyn LockStore>,
    prefix: String,
    holder: String,
    ttl: Duration,
}

impl LockManager {
    pub fn new(
        store: Arc<dyn LockStore>,
        prefix: impl Into<String>,
        holder: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            holder: holder.into(),
            ttl,
        }
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub async fn acquire(&self, name: &str) -> Result<bool> {
        let obtained = self.store.obtain_lock(name, &self.holder, self.ttl).await?;

        debug!(lock_name = name, holder = %self.holder, obtained, "Lock acquisition attempted");

        Ok(obtained)
    }

    pub async fn release(&self, name: &str) -> Result<bool> {
        let released = self.store.release_lock(name, &self.holder).await?;

        debug!(lock_name = name, holder = %self.holder, released, "Lock release attempted");

        Ok(released)
    }

    /// Locks this server holds that have not yet expired.
    pub async fn held_locks(&self) -> Result<Vec<LockRecord>> {
        let locks = self
            .store
            .locks_for_holder(&self.prefix, &self.holder)
            .await?;

        Ok(locks.into_iter().filter(|l| !l.is_expired()).collect())
    }

    /// Drop every lock recorded for this server, expired or not. Run at startup
    /// so a crashed predecessor with the same identity cannot block delivery.
    pub async fn release_own_locks(&self) -> Result<usize> {
        let locks = self
            .store
            .locks_for_holder(&self.prefix, &self.holder)
            .await?;

        info!(
            holder = %self.holder,
            count = locks.len(),
            "Locks held at startup"
        );

        let mut released = 0;
        for lock in &locks {
            if self.store.release_lock(&lock.name, &self.holder).await? {
                released += 1;
                info!(lock_name = %lock.name, holder = %lock.holder, "Stale lock released");
            }
        }

        Ok(released)
    }

    pub fn partition_name(&self, index: u32) -> String {
        format!("{}{}", self.prefix, index)
    }

    /// A partition picked uniformly from `[0, count)`.
    pub fn random_partition(&self, count: u32) -> String {
        let index = if count > 0 {
            rand::random_range(0..count)
        } else {
            0
        };

        self.partition_name(index)
    }

    /// All candidates, rotated to begin at a random position so servers polling
    /// at the same moment start on different partitions.
    pub fn candidate_order(&self, mut names: Vec<String>) -> Vec<String> {
        if names.len() > 1 {
            let offset = rand::random_range(0..names.len());
            names.rotate_left(offset);
        }

        names
    }
}
