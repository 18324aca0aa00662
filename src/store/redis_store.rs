//! Redis-backed store using server-side Lua scripts.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use tracing::{debug, info};

use super::{LockStore, QuotaStore};
use crate::config::StoreConfig;
use crate::error::{CoordkitError, Result};

// The key is read through KEYS[1] each time rather than bound to a local,
// some hosted redis flavours reject scripts that alias it.
const PERIOD_SCRIPT: &str = r#"local limit = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local current = redis.call("INCRBY", KEYS[1], 1)
if current == 1 then
    redis.call("expire", KEYS[1], window)
    return 1
elseif current < limit then
    return 1
elseif current == limit then
    return 2
else
    return 3
end"#;

const ACQUIRE_SCRIPT: &str = r#"local owner = redis.call("GET", KEYS[1])
if owner == ARGV[1] then
    redis.call("PEXPIRE", KEYS[1], ARGV[2])
    return true
elseif not owner then
    redis.call("SET", KEYS[1], ARGV[1], "PX", ARGV[2])
    return true
end
return false"#;

const RELEASE_SCRIPT: &str = r#"if redis.call("GET", KEYS[1]) == ARGV[1] then
    redis.call("DEL", KEYS[1])
    return true
else
    return false
end"#;

/// Store client for a shared redis server.
///
/// Cheap to clone; clones share the underlying multiplexed connection.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    period_script: Script,
    acquire_script: Script,
    release_script: Script,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect to the configured server and verify it answers a PING.
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        info!(url = %config.url, "Connecting to redis");

        let client = Client::open(config.url.as_str())?;
        let setup = async {
            let mut conn = ConnectionManager::new(client).await?;
            let _: String = redis::cmd("PING").query_async(&mut conn).await?;
            Ok::<_, CoordkitError>(conn)
        };
        let conn = tokio::time::timeout(config.timeout(), setup)
            .await
            .map_err(|_| CoordkitError::StoreTimeout(config.timeout()))??;

        info!("Redis connection established");
        Ok(Self::from_connection(conn))
    }

    /// Wrap an existing connection.
    pub fn from_connection(conn: ConnectionManager) -> Self {
        Self {
            conn,
            period_script: Script::new(PERIOD_SCRIPT),
            acquire_script: Script::new(ACQUIRE_SCRIPT),
            release_script: Script::new(RELEASE_SCRIPT),
        }
    }
}

#[async_trait]
impl QuotaStore for RedisStore {
    async fn incr_and_check(&self, key: &str, quota: u64, expire_secs: u64) -> Result<i64> {
        let mut conn = self.conn.clone();
        let code: i64 = self
            .period_script
            .key(key)
            .arg(quota)
            .arg(expire_secs)
            .invoke_async(&mut conn)
            .await?;
        Ok(code)
    }
}

#[async_trait]
impl LockStore for RedisStore {
    async fn acquire(&self, key: &str, token: &str, ttl_ms: u64) -> Result<bool> {
        let mut conn = self.conn.clone();
        // Lua true comes back as 1, false as nil.
        let reply: Option<i64> = self
            .acquire_script
            .key(key)
            .arg(token)
            .arg(ttl_ms)
            .invoke_async(&mut conn)
            .await?;
        debug!(key = %key, reply = ?reply, "Acquire script finished");
        Ok(reply == Some(1))
    }

    async fn release(&self, key: &str, token: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<i64> = self
            .release_script
            .key(key)
            .arg(token)
            .invoke_async(&mut conn)
            .await?;
        debug!(key = %key, reply = ?reply, "Release script finished");
        Ok(reply == Some(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{CODE_ALLOWED, CODE_HIT_QUOTA, CODE_OVER_QUOTA};

    async fn test_store() -> RedisStore {
        let url = std::env::var("COORDKIT_REDIS_URL")
            .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        let config = StoreConfig {
            url,
            ..StoreConfig::default()
        };
        RedisStore::connect(&config).await.unwrap()
    }

    #[tokio::test]
    async fn test_connect_unreachable_fails() {
        let config = StoreConfig {
            url: "redis://127.0.0.1:1".to_string(),
            timeout_ms: 500,
        };
        let err = RedisStore::connect(&config).await.unwrap_err();
        assert!(err.is_store_error());
    }

    #[tokio::test]
    async fn test_invalid_url_fails() {
        let config = StoreConfig {
            url: "not a url".to_string(),
            ..StoreConfig::default()
        };
        assert!(RedisStore::connect(&config).await.is_err());
    }

    #[tokio::test]
    #[ignore = "requires a redis server"]
    async fn test_redis_period_script() {
        let store = test_store().await;
        let key = format!("coordkit:test:{}", uuid::Uuid::new_v4());

        assert_eq!(store.incr_and_check(&key, 2, 5).await.unwrap(), CODE_ALLOWED);
        assert_eq!(store.incr_and_check(&key, 2, 5).await.unwrap(), CODE_HIT_QUOTA);
        assert_eq!(store.incr_and_check(&key, 2, 5).await.unwrap(), CODE_OVER_QUOTA);
    }

    #[tokio::test]
    #[ignore = "requires a redis server"]
    async fn test_redis_lock_scripts() {
        let store = test_store().await;
        let key = format!("coordkit:test:{}", uuid::Uuid::new_v4());

        assert!(store.acquire(&key, "a", 5000).await.unwrap());
        assert!(store.acquire(&key, "a", 5000).await.unwrap());
        assert!(!store.acquire(&key, "b", 5000).await.unwrap());
        assert!(!store.release(&key, "b").await.unwrap());
        assert!(store.release(&key, "a").await.unwrap());
        assert!(!store.release(&key, "a").await.unwrap());
    }
}
