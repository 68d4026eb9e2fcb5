use crate::errors::Result;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// Lock key prefixes
pub mod keys {
    pub const REDEEM: &str = "lock:redeem";

    pub fn redeem(transaction_no: &str) -> String {
        format!("{REDEEM}:{transaction_no}")
    }
}

const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Proof of ownership; only the holder's token can release the key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockGuard {
    pub key: String,
    pub token: String,
}

#[async_trait]
pub trait LockManager: Send + Sync {
    /// `None` when another owner holds the key
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockGuard>>;

    /// Returns whether the key was still ours to delete
    async fn release(&self, guard: &LockGuard) -> Result<bool>;
}

#[derive(Clone)]
pub struct RedisLock {
    redis: ConnectionManager,
}

impl RedisLock {
    pub fn new(redis: ConnectionManager) -> Self {
        Self { redis }
    }
}

impl std::fmt::Debug for RedisLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisLock").finish_non_exhaustive()
    }
}

#[async_trait]
impl LockManager for RedisLock {
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockGuard>> {
        let mut conn = self.redis.clone();
        let token = Uuid::new_v4().to_string();
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);

        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(&token)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await?;

        if reply.is_some() {
            debug!(key, ttl_ms, "Lock acquired");
            Ok(Some(LockGuard {
                key: key.to_string(),
                token,
            }))
        } else {
            debug!(key, "Lock busy");
            Ok(None)
        }
    }

    async fn release(&self, guard: &LockGuard) -> Result<bool> {
        let mut conn = self.redis.clone();
        let deleted: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(&guard.key)
            .arg(&guard.token)
            .invoke_async(&mut conn)
            .await?;

        if deleted == 0 {
            warn!(key = %guard.key, "Lock expired or taken over before release");
        }
        Ok(deleted == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redeem_key() {
        assert_eq!(keys::redeem("123456789012F007SK"), "lock:redeem:123456789012F007SK");
    }
}
