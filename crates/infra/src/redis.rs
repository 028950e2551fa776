//! Redis adapter for the distributed lock.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use tracing::info;

use crate::error::{ServiceError, ServiceResult};
use crate::lock::LockKv;

/// Deletes the key only while it still holds the caller's token.
const COMPARE_AND_DEL: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
end
return 0
"#;

fn map_redis_error(operation: &str, err: redis::RedisError) -> ServiceError {
    ServiceError::dependency(format!("redis {operation} failed: {err}"))
}

/// [`LockKv`] over a Redis connection manager (`SET NX PX`, `GET`, `DEL`).
#[derive(Clone)]
pub struct RedisLockKv {
    conn: ConnectionManager,
    compare_and_del: Script,
}

impl fmt::Debug for RedisLockKv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisLockKv")
            .field("connection", &"ConnectionManager")
            .finish()
    }
}

impl RedisLockKv {
    pub async fn connect(redis_url: &str) -> ServiceResult<Self> {
        let client = redis::Client::open(redis_url).map_err(|e| map_redis_error("open", e))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| map_redis_error("connect", e))?;
        info!("connected to redis lock store");
        Ok(Self {
            conn,
            compare_and_del: Script::new(COMPARE_AND_DEL),
        })
    }
}

#[async_trait]
impl LockKv for RedisLockKv {
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> ServiceResult<bool> {
        let mut conn = self.conn.clone();
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("SET NX", e))?;
        Ok(reply.is_some())
    }

    async fn get(&self, key: &str) -> ServiceResult<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await.map_err(|e| map_redis_error("GET", e))?;
        Ok(value)
    }

    async fn del(&self, key: &str) -> ServiceResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.del(key).await.map_err(|e| map_redis_error("DEL", e))?;
        Ok(())
    }

    async fn compare_and_del(&self, key: &str, expected: &str) -> ServiceResult<bool> {
        let mut conn = self.conn.clone();
        let deleted: i64 = self
            .compare_and_del
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("compare-and-delete", e))?;
        Ok(deleted == 1)
    }
}
