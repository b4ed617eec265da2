//! Store facade: a minimal, test-substitutable surface the loader engine
//! drives, backed in production by Redis.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use redis::aio::ConnectionManager;

use crate::error::StoreError;

/// The current remaining expiry of a key, distinguishing "no such key" from
/// "key exists with no expiry" the way Redis's `TTL` command does
/// (`-2`/`-1`/`>=0`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtlStatus {
    /// The key does not exist.
    NoKey,
    /// The key exists but has no expiry set.
    NoExpiry,
    /// The key exists with the given remaining expiry.
    Remaining(Duration),
}

/// The minimal backing-store contract the loader engine needs.
///
/// Implementations must be safe for concurrent use; the loader never
/// serializes calls to it.
#[async_trait]
pub trait Store: Send + Sync {
    /// Read a flat key. `Ok(None)` is a miss, distinct from a transport
    /// error.
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError>;

    /// Unconditionally write a flat key with the given TTL semantics.
    async fn set(&self, key: &str, value: Bytes, ttl: crate::config::Ttl) -> Result<(), StoreError>;

    /// Conditionally write a flat key if and only if it is absent,
    /// returning whether the write took effect.
    async fn set_nx(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool, StoreError>;

    /// Read a hash field. `Ok(None)` is a miss.
    async fn hget(&self, key: &str, field: &str) -> Result<Option<Bytes>, StoreError>;

    /// Unconditionally write a hash field; does not itself apply any
    /// expiry to the hash key.
    async fn hset(&self, key: &str, field: &str, value: Bytes) -> Result<(), StoreError>;

    /// Stamp an expiry on an existing key.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError>;

    /// The current remaining expiry of a key.
    async fn ttl(&self, key: &str) -> Result<TtlStatus, StoreError>;

    /// Atomically write a hash field and refresh the hash's overall expiry
    /// in a single round-trip.
    async fn hset_and_expire(
        &self,
        key: &str,
        field: &str,
        value: Bytes,
        ttl: Duration,
    ) -> Result<(), StoreError>;

    /// Delete a key.
    async fn del(&self, key: &str) -> Result<(), StoreError>;

    /// Run an atomic server-side Lua script with the given keys and
    /// string-typed arguments, returning its integer result.
    async fn eval_lua(&self, script: &str, keys: &[&str], args: &[&[u8]]) -> Result<i64, StoreError>;

    /// Idempotently close the store. The second call returns
    /// [`StoreError::Closed`].
    async fn close(&self) -> Result<(), StoreError>;

    /// Whether the store has already been closed. Checked by the loader
    /// before any other work, per the entry-validation order in
    /// `Loader::load`/`Loader::load_hash`.
    fn is_closed(&self) -> bool;
}

/// Redis-backed [`Store`] implementation.
///
/// Every command is issued with `redis::cmd("VERB").arg(...).query_async(...)`
/// rather than the `redis::AsyncCommands` trait sugar, matching the idiom
/// used throughout this codebase's other Redis call sites.
pub struct RedisStore {
    conn: ConnectionManager,
    closed: AtomicBool,
}

impl RedisStore {
    /// Open a connection to `redis_url` and wrap it in a `RedisStore`.
    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self::from_connection_manager(conn))
    }

    /// Wrap an already-constructed connection manager, e.g. one shared with
    /// a [`crate::lock::RedisLock`].
    pub fn from_connection_manager(conn: ConnectionManager) -> Self {
        Self {
            conn,
            closed: AtomicBool::new(false),
        }
    }

    fn check_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        self.check_open()?;
        let mut conn = self.conn.clone();
        let data: Option<Vec<u8>> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await?;
        Ok(data.map(Bytes::from))
    }

    async fn set(&self, key: &str, value: Bytes, ttl: crate::config::Ttl) -> Result<(), StoreError> {
        self.check_open()?;
        let mut conn = self.conn.clone();
        match ttl {
            crate::config::Ttl::NoStore => Ok(()),
            crate::config::Ttl::Persist => {
                redis::cmd("SET")
                    .arg(key)
                    .arg(value.as_ref())
                    .query_async(&mut conn)
                    .await?;
                Ok(())
            }
            crate::config::Ttl::Seconds(secs) => {
                redis::cmd("SETEX")
                    .arg(key)
                    .arg(secs)
                    .arg(value.as_ref())
                    .query_async(&mut conn)
                    .await?;
                Ok(())
            }
        }
    }

    async fn set_nx(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool, StoreError> {
        self.check_open()?;
        let mut conn = self.conn.clone();
        let result: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await?;
        Ok(result.is_some())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<Bytes>, StoreError> {
        self.check_open()?;
        let mut conn = self.conn.clone();
        let data: Option<Vec<u8>> = redis::cmd("HGET")
            .arg(key)
            .arg(field)
            .query_async(&mut conn)
            .await?;
        Ok(data.map(Bytes::from))
    }

    async fn hset(&self, key: &str, field: &str, value: Bytes) -> Result<(), StoreError> {
        self.check_open()?;
        let mut conn = self.conn.clone();
        redis::cmd("HSET")
            .arg(key)
            .arg(field)
            .arg(value.as_ref())
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        self.check_open()?;
        let mut conn = self.conn.clone();
        redis::cmd("EXPIRE")
            .arg(key)
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn ttl(&self, key: &str) -> Result<TtlStatus, StoreError> {
        self.check_open()?;
        let mut conn = self.conn.clone();
        let secs: i64 = redis::cmd("TTL").arg(key).query_async(&mut conn).await?;
        Ok(match secs {
            -2 => TtlStatus::NoKey,
            -1 => TtlStatus::NoExpiry,
            s => TtlStatus::Remaining(Duration::from_secs(s.max(0) as u64)),
        })
    }

    async fn hset_and_expire(
        &self,
        key: &str,
        field: &str,
        value: Bytes,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        self.check_open()?;
        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .cmd("HSET")
            .arg(key)
            .arg(field)
            .arg(value.as_ref())
            .ignore()
            .cmd("EXPIRE")
            .arg(key)
            .arg(ttl.as_secs().max(1))
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        self.check_open()?;
        let mut conn = self.conn.clone();
        redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(())
    }

    async fn eval_lua(&self, script: &str, keys: &[&str], args: &[&[u8]]) -> Result<i64, StoreError> {
        self.check_open()?;
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("EVAL");
        cmd.arg(script).arg(keys.len());
        for key in keys {
            cmd.arg(*key);
        }
        for arg in args {
            cmd.arg(*arg);
        }
        let result: i64 = cmd.query_async(&mut conn).await?;
        Ok(result)
    }

    async fn close(&self) -> Result<(), StoreError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
