use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use redis::{AsyncCommands, Client, Script, aio::MultiplexedConnection};
use tracing::{debug, info, warn};

use crate::{models::lock::LockRecord, store::LockStore};

const KEY_PREFIX: &str = "notification_lock:";

const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

const REFRESH_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("PEXPIRE", KEYS[1], ARGV[2])
else
    return 0
end
"#;

/// Partition locks as redis keys whose value is the holder and whose TTL is the
/// lock expiry, so expired locks disappear on their own.
pub struct RedisLockStore {
    connection: MultiplexedConnection,
}

impl RedisLockStore {
    pub async fn connect(redis_url: &str) -> Result<Self, Error> {
        info!("Connecting to Redis");

        let client =
            Client::open(redis_url).map_err(|_| anyhow!("Failed to create redis client"))?;

        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|_| anyhow!("Failed to connect to redis client"))?;

        info!("Redis connection established");

        Ok(Self { connection })
    }

    pub async fn health_check(&self) -> Result<(), Error> {
        let mut conn = self.connection.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow!("Redis ping failed: {}", e))?;

        Ok(())
    }

    fn key(name: &str) -> String {
        format!("{}{}", KEY_PREFIX, name)
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, Error> {
        let mut conn = self.connection.clone();
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await
                .map_err(|e| anyhow!("Failed to scan lock keys: {}", e))?;

            keys.extend(batch);

            if next == 0 {
                break;
            }
            cursor = next;
        }

        Ok(keys)
    }
}

#[async_trait]
impl LockStore for RedisLockStore {
    async fn obtain_lock(&self, name: &str, holder: &str, ttl: Duration) -> Result<bool> {
        let key = Self::key(name);
        let ttl_ms = ttl.num_milliseconds().max(1);
        let mut conn = self.connection.clone();

        let set: Option<String> = redis::cmd("SET")
            .arg(&key)
            .arg(holder)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow!("Failed to obtain lock {}: {}", name, e))?;

        if set.is_some() {
            return Ok(true);
        }

        let refreshed: i32 = Script::new(REFRESH_SCRIPT)
            .key(&key)
            .arg(holder)
            .arg(ttl_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| anyhow!("Failed to refresh lock {}: {}", name, e))?;

        debug!(lock_name = name, holder, refreshed = refreshed == 1, "Lock already present");

        Ok(refreshed == 1)
    }

    async fn release_lock(&self, name: &str, holder: &str) -> Result<bool> {
        let mut conn = self.connection.clone();

        let removed: i32 = Script::new(RELEASE_SCRIPT)
            .key(Self::key(name))
            .arg(holder)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| anyhow!("Failed to release lock {}: {}", name, e))?;

        Ok(removed > 0)
    }

    async fn locks_for_holder(&self, prefix: &str, holder: &str) -> Result<Vec<LockRecord>> {
        let keys = self
            .scan_keys(&lock_scan_pattern(prefix))
            .await?;
        let mut conn = self.connection.clone();
        let mut held = Vec::new();

        for key in keys {
            let owner: Option<String> = conn.get(&key).await?;
            if owner.as_deref() != Some(holder) {
                continue;
            }

            let remaining_ms: i64 = conn.pttl(&key).await?;
            if remaining_ms < 0 {
                warn!(key = %key, "Lock key has no expiry");
            }

            held.push(LockRecord {
                name: key.trim_start_matches(KEY_PREFIX).to_string(),
                holder: holder.to_string(),
                expires_at: Utc::now() + Duration::milliseconds(remaining_ms.max(0)),
            });
        }
        held.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(held)
    }
}

/// `SCAN MATCH` pattern for every lock key under `prefix`, with glob
/// metacharacters in the prefix matched literally.
pub fn lock_scan_pattern(prefix: &str) -> String {
    let mut pattern = String::with_capacity(KEY_PREFIX.len() + prefix.len() + 1);
    pattern.push_str(KEY_PREFIX);

    for c in prefix.chars() {
        if matches!(c, '\\' | '*' | '?' | '[' | ']') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('*');

    pattern
}
