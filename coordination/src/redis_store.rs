//! Redis backend for the cache store.
//!
//! Uses a multiplexed [`ConnectionManager`] and Lua scripts for the
//! operations that must be atomic across the fleet: token-guarded lock
//! release/refresh and TTL'd counters.

use std::collections::HashMap;
use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use tracing::{debug, error, info};

use crate::error::{CacheError, CacheResult};

/// `if GET == token then DEL` — never deletes a lock re-acquired by another
/// owner after expiry.
const RELEASE_LOCK: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
else
    return 0
end"#;

/// `if GET == token then PEXPIRE` — heartbeat refresh.
const REFRESH_LOCK: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
else
    return 0
end"#;

/// `INCRBY` plus optional `PEXPIRE` in one round trip.
const INCR_WITH_TTL: &str = r#"
local v = redis.call('INCRBY', KEYS[1], ARGV[1])
if tonumber(ARGV[2]) > 0 then
    redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return v"#;

pub struct RedisStore {
    manager: ConnectionManager,
    prefix: String,
    release_script: Script,
    refresh_script: Script,
    incr_script: Script,
}

impl RedisStore {
    pub async fn connect(connection_string: &str, prefix: &str) -> CacheResult<Self> {
        info!(prefix, "connecting to redis");
        let client = redis::Client::open(connection_string).map_err(|e| {
            error!(error = %e, "failed to create redis client");
            CacheError::Connection(e.to_string())
        })?;
        let manager = ConnectionManager::new(client).await.map_err(|e| {
            error!(error = %e, "failed to connect to redis");
            CacheError::Connection(e.to_string())
        })?;
        debug!(prefix, "redis connection established");

        Ok(Self {
            manager,
            prefix: prefix.to_string(),
            release_script: Script::new(RELEASE_LOCK),
            refresh_script: Script::new(REFRESH_LOCK),
            incr_script: Script::new(INCR_WITH_TTL),
        })
    }

    fn k(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    pub async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        let mut conn = self.manager.clone();
        Ok(conn.get(self.k(key)).await?)
    }

    pub async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> CacheResult<()> {
        let mut conn = self.manager.clone();
        match ttl {
            Some(ttl) => {
                let mut cmd = redis::cmd("SET");
                cmd.arg(self.k(key))
                    .arg(value)
                    .arg("PX")
                    .arg(ttl.as_millis() as u64);
                cmd.query_async::<()>(&mut conn).await?;
            }
            None => conn.set::<_, _, ()>(self.k(key), value).await?,
        }
        Ok(())
    }

    pub async fn delete(&self, key: &str) -> CacheResult<()> {
        let mut conn = self.manager.clone();
        conn.del::<_, ()>(self.k(key)).await?;
        Ok(())
    }

    pub async fn increment_by(
        &self,
        key: &str,
        delta: i64,
        ttl: Option<Duration>,
    ) -> CacheResult<i64> {
        let mut conn = self.manager.clone();
        let ttl_ms = ttl.map(|t| t.as_millis() as u64).unwrap_or(0);
        let v: i64 = self
            .incr_script
            .key(self.k(key))
            .arg(delta)
            .arg(ttl_ms)
            .invoke_async(&mut conn)
            .await?;
        Ok(v)
    }

    pub async fn hash_set(&self, key: &str, field: &str, value: &str) -> CacheResult<()> {
        let mut conn = self.manager.clone();
        conn.hset::<_, _, _, ()>(self.k(key), field, value).await?;
        Ok(())
    }

    pub async fn hash_set_multi(
        &self,
        key: &str,
        fields: &[(&str, String)],
        ttl: Option<Duration>,
    ) -> CacheResult<()> {
        let mut conn = self.manager.clone();
        let key = self.k(key);
        let pairs: Vec<(&str, &str)> = fields.iter().map(|(f, v)| (*f, v.as_str())).collect();
        conn.hset_multiple::<_, _, _, ()>(&key, &pairs).await?;
        if let Some(ttl) = ttl {
            conn.pexpire::<_, ()>(&key, ttl.as_millis() as i64).await?;
        }
        Ok(())
    }

    pub async fn hash_get_all(&self, key: &str) -> CacheResult<HashMap<String, String>> {
        let mut conn = self.manager.clone();
        Ok(conn.hgetall(self.k(key)).await?)
    }

    pub async fn hash_delete(&self, key: &str, field: &str) -> CacheResult<()> {
        let mut conn = self.manager.clone();
        conn.hdel::<_, _, ()>(self.k(key), field).await?;
        Ok(())
    }

    pub async fn acquire_lock(&self, key: &str, token: &str, ttl: Duration) -> CacheResult<bool> {
        let mut conn = self.manager.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(self.k(key))
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64);
        let out: Option<String> = cmd.query_async(&mut conn).await?;
        Ok(out.is_some())
    }

    pub async fn release_lock(&self, key: &str, token: &str) -> CacheResult<bool> {
        let mut conn = self.manager.clone();
        let deleted: i64 = self
            .release_script
            .key(self.k(key))
            .arg(token)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted == 1)
    }

    pub async fn refresh_lock(&self, key: &str, token: &str, ttl: Duration) -> CacheResult<bool> {
        let mut conn = self.manager.clone();
        let refreshed: i64 = self
            .refresh_script
            .key(self.k(key))
            .arg(token)
            .arg(ttl.as_millis() as u64)
            .invoke_async(&mut conn)
            .await?;
        Ok(refreshed == 1)
    }

    pub async fn publish(&self, channel: &str, payload: &str) -> CacheResult<()> {
        let mut conn = self.manager.clone();
        conn.publish::<_, _, ()>(self.k(channel), payload).await?;
        Ok(())
    }
}
