//! Redis coordination store for the storefront backend.
//!
//! Each lock key is a Redis hash `{holder -> hold count}` with a millisecond
//! TTL acting as the lease. All state changes run as Lua scripts, so a check
//! and the write that depends on it are one atomic step on the server.
//!
//! # Scripts
//!
//! | Script | Effect |
//! |---|---|
//! | acquire | free key: `HINCRBY holder 1`, `PEXPIRE lease`; same holder: `HINCRBY holder 1`, `PEXPIRE lease` only if it lengthens the `PTTL`; both return nil, otherwise return the remaining `PTTL` |
//! | release | owner only: `HINCRBY holder -1`, `DEL` at zero, return the remaining count |
//! | extend | owner only: `PEXPIRE lease`, return 1 |
//!
//! Waiting is a spin: the acquire script is retried every `spin_interval`
//! (default 50ms, with jitter) until it succeeds or the wait time is spent.
//!
//! # Example
//!
//! ```no_run
//! use storefront_redis::RedisCoordinationStore;
//! use storefront_core::coordination::{CoordinationStore, HolderId};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = RedisCoordinationStore::new("redis://127.0.0.1:6379").await?;
//! let holder = HolderId::new("node-a", "chain-1");
//!
//! if let Some(token) = store
//!     .try_acquire("lock:product:100", &holder, Duration::from_secs(3), Duration::from_secs(5))
//!     .await?
//! {
//!     // ... critical section ...
//!     store.release(&token).await?;
//! }
//! # Ok(())
//! # }
//! ```

use rand::Rng;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisError, Script};
use std::time::{Duration, Instant};
use storefront_core::coordination::{
    CoordinationError, CoordinationFuture, CoordinationStore, HolderId, LockToken,
};

/// Default pause between acquisition attempts.
pub const DEFAULT_SPIN_INTERVAL: Duration = Duration::from_millis(50);

const ACQUIRE_SCRIPT: &str = r"
if (redis.call('exists', KEYS[1]) == 0) then
    redis.call('hincrby', KEYS[1], ARGV[2], 1);
    redis.call('pexpire', KEYS[1], ARGV[1]);
    return nil;
end;
if (redis.call('hexists', KEYS[1], ARGV[2]) == 1) then
    redis.call('hincrby', KEYS[1], ARGV[2], 1);
    if (redis.call('pttl', KEYS[1]) < tonumber(ARGV[1])) then
        redis.call('pexpire', KEYS[1], ARGV[1]);
    end;
    return nil;
end;
return redis.call('pttl', KEYS[1]);
";

const RELEASE_SCRIPT: &str = r"
if (redis.call('hexists', KEYS[1], ARGV[1]) == 0) then
    return 0;
end;
local counter = redis.call('hincrby', KEYS[1], ARGV[1], -1);
if (counter > 0) then
    return counter;
end;
redis.call('del', KEYS[1]);
return 0;
";

const EXTEND_SCRIPT: &str = r"
if (redis.call('hexists', KEYS[1], ARGV[2]) == 1) then
    redis.call('pexpire', KEYS[1], ARGV[1]);
    return 1;
end;
return 0;
";

/// `Redis`-backed [`CoordinationStore`].
#[derive(Clone)]
pub struct RedisCoordinationStore {
    conn_manager: ConnectionManager,
    spin_interval: Duration,
    acquire: Script,
    release: Script,
    extend: Script,
}

impl RedisCoordinationStore {
    /// Connect to `redis_url`.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinationError::ConnectionFailed`] if the client cannot be
    /// created or the first connection fails.
    pub async fn new(redis_url: &str) -> Result<Self, CoordinationError> {
        let client = Client::open(redis_url).map_err(|e| {
            CoordinationError::ConnectionFailed(format!("Failed to create Redis client: {e}"))
        })?;

        let conn_manager = ConnectionManager::new(client).await.map_err(|e| {
            CoordinationError::ConnectionFailed(format!(
                "Failed to create Redis connection manager: {e}"
            ))
        })?;

        Ok(Self::from_manager(conn_manager))
    }

    /// Wrap an existing connection manager.
    #[must_use]
    pub fn from_manager(conn_manager: ConnectionManager) -> Self {
        Self {
            conn_manager,
            spin_interval: DEFAULT_SPIN_INTERVAL,
            acquire: Script::new(ACQUIRE_SCRIPT),
            release: Script::new(RELEASE_SCRIPT),
            extend: Script::new(EXTEND_SCRIPT),
        }
    }

    /// Override the pause between acquisition attempts.
    #[must_use]
    pub fn with_spin_interval(mut self, spin_interval: Duration) -> Self {
        self.spin_interval = spin_interval.max(Duration::from_millis(1));
        self
    }

    fn pause(&self, remaining: Duration, ttl_ms: i64) -> Duration {
        let spin_ms = u64::try_from(self.spin_interval.as_millis()).unwrap_or(u64::MAX);
        let jitter = rand::thread_rng().gen_range(0..=spin_ms / 5);
        let mut pause = Duration::from_millis(spin_ms.saturating_add(jitter)).min(remaining);
        if let Ok(ttl) = u64::try_from(ttl_ms) {
            if ttl > 0 {
                pause = pause.min(Duration::from_millis(ttl));
            }
        }
        pause
    }
}

fn as_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX).max(1)
}

fn command_failed(key: &str, error: &RedisError) -> CoordinationError {
    if error.is_io_error() || error.is_connection_dropped() || error.is_connection_refusal() {
        CoordinationError::ConnectionFailed(error.to_string())
    } else {
        CoordinationError::CommandFailed {
            key: key.to_string(),
            reason: error.to_string(),
        }
    }
}

impl CoordinationStore for RedisCoordinationStore {
    fn try_acquire(
        &self,
        key: &str,
        holder: &HolderId,
        wait: Duration,
        lease: Duration,
    ) -> CoordinationFuture<'_, Option<LockToken>> {
        let key = key.to_string();
        let holder = holder.clone();
        Box::pin(async move {
            let mut conn = self.conn_manager.clone();
            let lease_ms = as_millis(lease);
            let deadline = Instant::now() + wait;
            let mut attempts = 0u32;

            loop {
                attempts += 1;
                let ttl: Option<i64> = self
                    .acquire
                    .key(&key)
                    .arg(lease_ms)
                    .arg(holder.as_str())
                    .invoke_async(&mut conn)
                    .await
                    .map_err(|e| command_failed(&key, &e))?;

                let Some(ttl_ms) = ttl else {
                    tracing::trace!(key = %key, holder = %holder, attempts, "Redis lock granted");
                    return Ok(Some(LockToken::new(key, holder)));
                };

                let now = Instant::now();
                if now >= deadline {
                    tracing::debug!(key = %key, holder = %holder, attempts, ttl_ms, "Redis lock still busy at deadline");
                    return Ok(None);
                }
                tokio::time::sleep(self.pause(deadline - now, ttl_ms)).await;
            }
        })
    }

    fn release(&self, token: &LockToken) -> CoordinationFuture<'_, u32> {
        let token = token.clone();
        Box::pin(async move {
            let mut conn = self.conn_manager.clone();
            let remaining: i64 = self
                .release
                .key(token.key())
                .arg(token.holder().as_str())
                .invoke_async(&mut conn)
                .await
                .map_err(|e| command_failed(token.key(), &e))?;
            Ok(u32::try_from(remaining).unwrap_or(0))
        })
    }

    fn extend_lease(&self, token: &LockToken, lease: Duration) -> CoordinationFuture<'_, bool> {
        let token = token.clone();
        Box::pin(async move {
            let mut conn = self.conn_manager.clone();
            let extended: i64 = self
                .extend
                .key(token.key())
                .arg(as_millis(lease))
                .arg(token.holder().as_str())
                .invoke_async(&mut conn)
                .await
                .map_err(|e| command_failed(token.key(), &e))?;
            Ok(extended == 1)
        })
    }

    fn hold_count(&self, key: &str, holder: &HolderId) -> CoordinationFuture<'_, u32> {
        let key = key.to_string();
        let holder = holder.clone();
        Box::pin(async move {
            let mut conn = self.conn_manager.clone();
            let count: Option<u32> = conn
                .hget(&key, holder.as_str())
                .await
                .map_err(|e| command_failed(&key, &e))?;
            Ok(count.unwrap_or(0))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_round_up_to_one_millisecond() {
        assert_eq!(as_millis(Duration::ZERO), 1);
        assert_eq!(as_millis(Duration::from_secs(5)), 5000);
    }

    #[test]
    fn scripts_key_by_holder_field() {
        assert!(ACQUIRE_SCRIPT.contains("hincrby"));
        assert!(ACQUIRE_SCRIPT.contains("pttl', KEYS[1]) < tonumber(ARGV[1])"));
        assert!(RELEASE_SCRIPT.contains("'del'"));
        assert!(EXTEND_SCRIPT.contains("pexpire"));
    }
}
