//! In-process test doubles for [`crate::store::Store`] and
//! [`crate::lock::DistributedLock`], so the loader engine's concurrency
//! behavior can be exercised without a live Redis instance.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::Ttl;
use crate::error::{LockError, StoreError};
use crate::lock::{DistributedLock, LockToken};
use crate::store::{Store, TtlStatus};

struct Entry {
    value: Bytes,
    expires_at: Option<Instant>,
}

/// An in-memory [`Store`] backed by a [`DashMap`], mirroring the shape of
/// this codebase's other `DashMap`-backed test/dev backing stores.
#[derive(Default)]
pub struct MockStore {
    flat: DashMap<String, Entry>,
    hashes: DashMap<String, (HashMap<String, Bytes>, Option<Instant>)>,
    closed: AtomicBool,
}

impl MockStore {
    /// Build an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn flat_is_live(entry: &Entry) -> bool {
        entry.expires_at.map(|at| at > Instant::now()).unwrap_or(true)
    }

    fn check_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    /// Test helper: the remaining TTL actually recorded for a flat key, if
    /// any and if still live.
    pub fn remaining_ttl(&self, key: &str) -> Option<Duration> {
        self.flat.get(key).and_then(|e| {
            if !Self::flat_is_live(&e) {
                return None;
            }
            e.expires_at.map(|at| at.saturating_duration_since(Instant::now()))
        })
    }
}

#[async_trait]
impl Store for MockStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        self.check_open()?;
        Ok(self.flat.get(key).and_then(|e| {
            if Self::flat_is_live(&e) {
                Some(e.value.clone())
            } else {
                None
            }
        }))
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Ttl) -> Result<(), StoreError> {
        self.check_open()?;
        match ttl {
            Ttl::NoStore => {}
            Ttl::Persist => {
                self.flat.insert(
                    key.to_string(),
                    Entry {
                        value,
                        expires_at: None,
                    },
                );
            }
            Ttl::Seconds(secs) => {
                self.flat.insert(
                    key.to_string(),
                    Entry {
                        value,
                        expires_at: Some(Instant::now() + Duration::from_secs(secs)),
                    },
                );
            }
        }
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool, StoreError> {
        self.check_open()?;
        if self.flat.contains_key(key) {
            return Ok(false);
        }
        self.flat.insert(
            key.to_string(),
            Entry {
                value: Bytes::copy_from_slice(value),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<Bytes>, StoreError> {
        self.check_open()?;
        Ok(self
            .hashes
            .get(key)
            .and_then(|h| h.0.get(field).cloned()))
    }

    async fn hset(&self, key: &str, field: &str, value: Bytes) -> Result<(), StoreError> {
        self.check_open()?;
        self.hashes
            .entry(key.to_string())
            .or_insert_with(|| (HashMap::new(), None))
            .0
            .insert(field.to_string(), value);
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        self.check_open()?;
        if let Some(mut h) = self.hashes.get_mut(key) {
            h.1 = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    async fn ttl(&self, key: &str) -> Result<TtlStatus, StoreError> {
        self.check_open()?;
        match self.hashes.get(key) {
            None => Ok(TtlStatus::NoKey),
            Some(h) => Ok(match h.1 {
                None => TtlStatus::NoExpiry,
                Some(at) => TtlStatus::Remaining(at.saturating_duration_since(Instant::now())),
            }),
        }
    }

    async fn hset_and_expire(
        &self,
        key: &str,
        field: &str,
        value: Bytes,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        self.check_open()?;
        let mut entry = self
            .hashes
            .entry(key.to_string())
            .or_insert_with(|| (HashMap::new(), None));
        entry.0.insert(field.to_string(), value);
        entry.1 = Some(Instant::now() + ttl);
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        self.check_open()?;
        self.flat.remove(key);
        self.hashes.remove(key);
        Ok(())
    }

    async fn eval_lua(&self, _script: &str, _keys: &[&str], _args: &[&[u8]]) -> Result<i64, StoreError> {
        self.check_open()?;
        Ok(0)
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

/// An in-memory [`DistributedLock`] for tests: a single `Mutex`-guarded
/// table of held locks, sufficient to exercise contention and expiry
/// without a real Redis instance.
#[derive(Default)]
pub struct MockLock {
    held: Mutex<HashMap<String, (Vec<u8>, Instant)>>,
}

impl MockLock {
    /// Build an empty lock table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Test helper: seed the table as if `name` were already held, for the
    /// TTL given, by some other acquirer.
    pub async fn seed_held(&self, name: &str, ttl: Duration) {
        let mut held = self.held.lock().await;
        held.insert(name.to_string(), (vec![0xAA; 16], Instant::now() + ttl));
    }
}

#[async_trait]
impl DistributedLock for MockLock {
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
            {
                let mut held = self.held.lock().await;
                let expired = held.get(name).map(|(_, at)| *at <= Instant::now()).unwrap_or(true);
                if expired {
                    let secret = uuid::Uuid::new_v4().as_bytes().to_vec();
                    held.insert(name.to_string(), (secret.clone(), Instant::now() + ttl));
                    return Ok(LockToken::new(name.to_string(), secret));
                }
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
        let mut held = self.held.lock().await;
        match held.get(token.name()) {
            Some((secret, _)) if secret.as_slice() == token.secret() => {
                held.remove(token.name());
                Ok(())
            }
            _ => Err(LockError::Expired),
        }
    }
}
