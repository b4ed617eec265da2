//! Distributed lock primitive: single-instance mutual exclusion on a named
//! key with a TTL safety net, backed by `SET NX EX` plus an atomic
//! compare-and-delete release script.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rand::RngCore;
use redis::aio::ConnectionManager;
use tokio_util::sync::CancellationToken;

use crate::error::{LockError, StoreError};

/// The fixed atomic compare-and-delete script: releases the lock only if
/// the stored value still equals the acquirer's token.
const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Opaque handle bound to one successful lock acquisition. Carries the
/// identity needed to release exactly this acquirer's lock.
#[derive(Debug, Clone)]
pub struct LockToken {
    name: String,
    secret: Vec<u8>,
}

impl LockToken {
    /// The lock's fully qualified name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Construct a token directly. Exposed crate-wide so test-double lock
    /// implementations (see [`crate::testing::MockLock`]) can mint tokens
    /// without depending on Redis.
    pub(crate) fn new(name: String, secret: Vec<u8>) -> Self {
        Self { name, secret }
    }

    pub(crate) fn secret(&self) -> &[u8] {
        &self.secret
    }
}

/// Pluggable mutual-exclusion primitive.
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Acquire a lock named `name` for `ttl`, optionally retrying
    /// `retry_count` further times with `retry_interval` between attempts
    /// if the first attempt is contended. Honors `cancel` on every wait.
    async fn acquire(
        &self,
        name: &str,
        ttl: Duration,
        retry_count: u32,
        retry_interval: Duration,
        cancel: &CancellationToken,
    ) -> Result<LockToken, LockError>;

    /// Release a previously acquired lock. A no-op return of
    /// [`LockError::Expired`] means the token no longer matched (expired or
    /// stolen) — informational, not fatal.
    async fn release(&self, token: LockToken) -> Result<(), LockError>;
}

/// Counter used in the RNG-failure fallback token, guaranteeing uniqueness
/// even if the system RNG and the clock both degenerate.
static TOKEN_COUNTER: AtomicU64 = AtomicU64::new(0);

fn random_token() -> Vec<u8> {
    let mut bytes = [0u8; 16];
    match rand::rngs::OsRng.try_fill_bytes(&mut bytes) {
        Ok(()) => bytes.to_vec(),
        Err(err) => {
            tracing::warn!(error = %err, "cryptographic RNG failed, falling back to mixed identity token");
            fallback_token()
        }
    }
}

/// Fallback token for the (practically unreachable) case an RNG read
/// fails: process id, a monotonic timestamp, and a process-local counter,
/// mixed together. Unique across concurrent acquirers within one process
/// and exceedingly unlikely to collide across processes.
fn fallback_token() -> Vec<u8> {
    let pid = std::process::id() as u64;
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    let counter = TOKEN_COUNTER.fetch_add(1, Ordering::Relaxed);
    let mixed = pid ^ nanos ^ counter;
    mixed.to_be_bytes().to_vec()
}

/// Redis-backed [`DistributedLock`], grounded on the `SET key value NX EX
/// ttl` acquire / Lua compare-and-delete release pattern used for job
/// scheduling locks elsewhere in this codebase.
pub struct RedisLock {
    conn: ConnectionManager,
}

impl RedisLock {
    /// Wrap an already-constructed connection manager.
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl DistributedLock for RedisLock {
    async fn acquire(
        &self,
        name: &str,
        ttl: Duration,
        retry_count: u32,
        retry_interval: Duration,
        cancel: &CancellationToken,
    ) -> Result<LockToken, LockError> {
        if ttl.is_zero() {
            return Err(LockError::InvalidTtl);
        }

        let mut attempts_left = 1 + retry_count;
        loop {
            let secret = random_token();
            let mut conn = self.conn.clone();
            let result: Option<String> = redis::cmd("SET")
                .arg(name)
                .arg(&secret)
                .arg("NX")
                .arg("EX")
                .arg(ttl.as_secs().max(1))
                .query_async(&mut conn)
                .await
                .map_err(StoreError::from)?;

            if result.is_some() {
                return Ok(LockToken {
                    name: name.to_string(),
                    secret,
                });
            }

            attempts_left -= 1;
            if attempts_left == 0 {
                return Err(LockError::Contended);
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(LockError::Contended),
                _ = tokio::time::sleep(retry_interval) => {}
            }
        }
    }

    async fn release(&self, token: LockToken) -> Result<(), LockError> {
        let mut conn = self.conn.clone();
        let result: i64 = redis::cmd("EVAL")
            .arg(RELEASE_SCRIPT)
            .arg(1)
            .arg(&token.name)
            .arg(&token.secret)
            .query_async(&mut conn)
            .await
            .map_err(StoreError::from)?;

        if result == 1 {
            Ok(())
        } else {
            tracing::info!(lock = %token.name, "lock already expired or stolen before release");
            Err(LockError::Expired)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_tokens_are_sixteen_bytes_and_distinct() {
        let a = random_token();
        let b = random_token();
        assert_eq!(a.len(), 16);
        assert_ne!(a, b);
    }

    #[test]
    fn fallback_tokens_are_distinct_across_calls() {
        let a = fallback_token();
        let b = fallback_token();
        assert_ne!(a, b);
    }
}
