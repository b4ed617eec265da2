//! The loader engine: orchestrates the fast cache read, single-flight
//! dedup, optional distributed lock, panic-guarded source call, jittered
//! write-back, and lock-contention wait-and-retry loop.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::FutureExt;
use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::config::{LoaderConfig, Ttl};
use crate::dedup::DedupGroup;
use crate::error::{ConfigError, LoadError, LoadResult, LockError, PanicPayload, StoreError};
use crate::key::{CacheKey, HashField, Lookup};
use crate::lock::{DistributedLock, LockToken};
use crate::store::{Store, TtlStatus};

#[derive(Debug)]
struct LoadTimeoutError;

impl std::fmt::Display for LoadTimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("load function exceeded its load timeout")
    }
}

impl std::error::Error for LoadTimeoutError {}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    source_invocations: AtomicU64,
    source_panics: AtomicU64,
    lock_contentions: AtomicU64,
    write_failures: AtomicU64,
}

/// Point-in-time snapshot of a [`Loader`]'s counters. Ambient observability,
/// not part of the read-through contract itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoaderStats {
    /// Fast-path cache hits.
    pub hits: u64,
    /// Fast-path cache misses that proceeded into dedup/source.
    pub misses: u64,
    /// Number of times the caller-supplied load function actually ran.
    pub source_invocations: u64,
    /// Number of times the load function panicked.
    pub source_panics: u64,
    /// Number of times lock acquisition was contended.
    pub lock_contentions: u64,
    /// Number of times the best-effort write-back failed.
    pub write_failures: u64,
}

struct Inner {
    store: Arc<dyn Store>,
    lock: Option<Arc<dyn DistributedLock>>,
    config: LoaderConfig,
    dedup: DedupGroup,
    stats: Counters,
}

/// Concurrency-safe, panic-safe, single-flight-deduplicated cache-aside
/// loader over a [`Store`], optionally guarded by a [`DistributedLock`]
/// for cross-process mutual exclusion.
///
/// Cheap to clone: internally an `Arc`, so a single `Loader` can be shared
/// across tasks.
#[derive(Clone)]
pub struct Loader(Arc<Inner>);

impl Loader {
    /// Build a loader over `store`, optionally guarded by `lock`.
    ///
    /// If `config.dist_lock_enabled()` is set and neither `config`'s own
    /// `external_lock` nor `lock` supplies an implementation, construction
    /// fails — matching the specification's "ExternalLock set while
    /// DistLockEnabled=false" class of construction-time configuration
    /// error, generalized to the symmetric case.
    pub fn new(
        store: Arc<dyn Store>,
        lock: Option<Arc<dyn DistributedLock>>,
        config: LoaderConfig,
    ) -> Result<Self, ConfigError> {
        let effective_lock = config.external_lock().cloned().or(lock);
        if config.dist_lock_enabled() && effective_lock.is_none() {
            return Err(ConfigError::Invalid(
                "distributed locking enabled but no lock implementation was supplied".to_string(),
            ));
        }
        Ok(Self(Arc::new(Inner {
            store,
            lock: effective_lock,
            config,
            dedup: DedupGroup::new(),
            stats: Counters::default(),
        })))
    }

    /// A snapshot of this loader's counters.
    pub fn stats(&self) -> LoaderStats {
        let c = &self.0.stats;
        LoaderStats {
            hits: c.hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            source_invocations: c.source_invocations.load(Ordering::Relaxed),
            source_panics: c.source_panics.load(Ordering::Relaxed),
            lock_contentions: c.lock_contentions.load(Ordering::Relaxed),
            write_failures: c.write_failures.load(Ordering::Relaxed),
        }
    }

    /// Read-through a flat key: on a cache hit, return the stored value.
    /// On a miss, run `load_fn` (deduplicated against any concurrent call
    /// for the same key) and write its result back with `ttl`.
    pub async fn load<F, Fut, E>(
        &self,
        key: &str,
        ttl: Ttl,
        cancel: &CancellationToken,
        load_fn: F,
    ) -> LoadResult<Bytes>
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Bytes, E>> + Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        let key = CacheKey::new(key).map_err(Arc::new)?;
        let token = key.as_str().to_string();
        self.load_lookup(Lookup::Key(key), token, ttl, cancel, load_fn)
            .await
    }

    /// Read-through one field of a hash. Collision-free with respect to
    /// every other `(key, field)` pair: see [`HashField::composite_token`].
    pub async fn load_hash<F, Fut, E>(
        &self,
        key: &str,
        field: &str,
        ttl: Ttl,
        cancel: &CancellationToken,
        load_fn: F,
    ) -> LoadResult<Bytes>
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Bytes, E>> + Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        let hash_field = HashField::new(key, field).map_err(Arc::new)?;
        let token = hash_field.composite_token();
        self.load_lookup(Lookup::Hash(hash_field), token, ttl, cancel, load_fn)
            .await
    }

    async fn load_lookup<F, Fut, E>(
        &self,
        lookup: Lookup,
        token: String,
        ttl: Ttl,
        cancel: &CancellationToken,
        load_fn: F,
    ) -> LoadResult<Bytes>
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Bytes, E>> + Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        let inner = self.0.clone();

        // Entry validation: a closed facade is rejected fail-fast, before
        // any other work (including the fast-path read) is attempted.
        if inner.store.is_closed() {
            return Err(Arc::new(LoadError::Closed));
        }

        // Step 1: fast path.
        match Inner::store_read(inner.store.as_ref(), &lookup).await {
            Ok(Some(value)) => {
                inner.stats.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(value);
            }
            Ok(None) => {
                inner.stats.misses.fetch_add(1, Ordering::Relaxed);
            }
            Err(StoreError::Closed) => {
                // The facade was closed concurrently with this call; treat
                // it the same as having been closed at entry rather than
                // falling through into dedup/lock/source.
                return Err(Arc::new(LoadError::Closed));
            }
            Err(e) => {
                // A non-miss transport error flows into dedup too, rather
                // than hammering the origin during a store incident.
                tracing::warn!(error = %e, "cache read failed on fast path");
            }
        }

        // Step 2.
        if cancel.is_cancelled() {
            return Err(Arc::new(LoadError::Cancelled));
        }

        let lock_name = format!("{}{}", inner.config.dist_lock_prefix(), token);

        let result = if inner.config.dedup_enabled() {
            let worker_inner = inner.clone();
            let worker_lookup = lookup.clone();
            // The worker's own context is detached from every caller's
            // cancellation: it is shared by every caller deduplicated onto
            // this token, so no single caller's cancel may cut it short.
            inner
                .dedup
                .do_work(token, cancel, move || {
                    Inner::run_worker_guarded(
                        worker_inner,
                        worker_lookup,
                        lock_name,
                        CancellationToken::new(),
                        ttl,
                        load_fn,
                    )
                })
                .await
        } else {
            // Dedup disabled: per spec.md §4.4 step 3, continue inline with
            // the caller's own context rather than a detached one. The
            // whole worker region is additionally raced against the
            // caller's `cancel` so lock-acquire/backoff/source awaits are
            // abandoned promptly on cancellation, exactly as dedup's
            // per-caller race does when dedup is enabled.
            let region_cancel = cancel.clone();
            let work = Inner::run_worker_guarded(
                inner.clone(),
                lookup,
                lock_name,
                region_cancel,
                ttl,
                load_fn,
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(Arc::new(LoadError::Cancelled)),
                res = work => res.map_err(Arc::new),
            }
        };

        if let Err(e) = &result {
            if matches!(e.as_ref(), LoadError::Panic(_)) {
                inner.stats.source_panics.fetch_add(1, Ordering::Relaxed);
            }
        }

        result
    }
}

impl Inner {
    async fn store_read(
        store: &dyn Store,
        lookup: &Lookup,
    ) -> Result<Option<Bytes>, crate::error::StoreError> {
        match lookup {
            Lookup::Key(k) => store.get(k.as_str()).await,
            Lookup::Hash(h) => store.hget(h.key().as_str(), h.field()).await,
        }
    }

    async fn store_write(
        store: &dyn Store,
        lookup: &Lookup,
        value: Bytes,
        ttl: Ttl,
        hash_ttl_refresh: bool,
    ) -> Result<(), crate::error::StoreError> {
        match lookup {
            Lookup::Key(k) => store.set(k.as_str(), value, ttl).await,
            Lookup::Hash(h) => match ttl {
                Ttl::Seconds(secs) => {
                    let dur = Duration::from_secs(secs);
                    if hash_ttl_refresh {
                        store
                            .hset_and_expire(h.key().as_str(), h.field(), value, dur)
                            .await
                    } else {
                        store.hset(h.key().as_str(), h.field(), value).await?;
                        match store.ttl(h.key().as_str()).await? {
                            TtlStatus::Remaining(_) => Ok(()),
                            TtlStatus::NoExpiry | TtlStatus::NoKey => {
                                store.expire(h.key().as_str(), dur).await
                            }
                        }
                    }
                }
                Ttl::Persist | Ttl::NoStore => {
                    store.hset(h.key().as_str(), h.field(), value).await
                }
            },
        }
    }

    async fn run_worker_guarded<F, Fut, E>(
        inner: Arc<Inner>,
        lookup: Lookup,
        lock_name: String,
        ctx_cancel: CancellationToken,
        ttl: Ttl,
        load_fn: F,
    ) -> Result<Bytes, LoadError>
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Bytes, E>> + Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        match AssertUnwindSafe(Self::run_worker(inner, lookup, lock_name, ctx_cancel, ttl, load_fn))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic_payload) => Err(LoadError::Panic(PanicPayload::from_panic(panic_payload))),
        }
    }

    async fn run_worker<F, Fut, E>(
        inner: Arc<Inner>,
        lookup: Lookup,
        lock_name: String,
        ctx_cancel: CancellationToken,
        ttl: Ttl,
        load_fn: F,
    ) -> Result<Bytes, LoadError>
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Bytes, E>> + Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        // Step 4: double-check.
        if let Ok(Some(value)) = Self::store_read(inner.store.as_ref(), &lookup).await {
            return Ok(value);
        }

        // `ctx_cancel` is the context everything downstream (lock
        // acquire/backoff, the source call itself) runs under: a fresh,
        // independent token when this worker is shared via dedup (so no
        // single caller's cancellation can cut off work other callers are
        // waiting on), or the caller's own `cancel` inline when dedup is
        // disabled for this load, per spec.md §4.4 step 3.
        let detached_cancel = ctx_cancel;
        let mut held_lock: Option<LockToken> = None;

        // Step 5: optional distributed lock.
        if inner.config.dist_lock_enabled() {
            if let Some(lock_impl) = inner.lock.clone() {
                match lock_impl
                    .acquire(
                        &lock_name,
                        inner.config.dist_lock_ttl(),
                        0,
                        Duration::ZERO,
                        &detached_cancel,
                    )
                    .await
                {
                    Ok(token) => {
                        if let Ok(Some(value)) = Self::store_read(inner.store.as_ref(), &lookup).await {
                            Self::release_detached(lock_impl, token);
                            return Ok(value);
                        }
                        held_lock = Some(token);
                    }
                    Err(LockError::InvalidTtl) => {
                        return Err(LoadError::Config(ConfigError::InvalidLockTtl));
                    }
                    Err(LockError::Contended) | Err(LockError::Store(_)) => {
                        inner.stats.lock_contentions.fetch_add(1, Ordering::Relaxed);
                        if let Some(value) =
                            Self::wait_and_retry(&inner, &lookup, &detached_cancel).await?
                        {
                            return Ok(value);
                        }
                        // Budget exhausted: fall through to the source call
                        // as a best-effort escape valve.
                    }
                    Err(LockError::Expired) => unreachable!("acquire never returns Expired"),
                }
            }
        }

        // Step 6: source call, panic-guarded by the caller (`run_worker_guarded`).
        inner.stats.source_invocations.fetch_add(1, Ordering::Relaxed);
        let fut = load_fn(detached_cancel.clone());
        let source_result: Result<Bytes, LoadError> = if inner.config.load_timeout().is_zero() {
            fut.await.map_err(|e| LoadError::Source(Box::new(e)))
        } else {
            match tokio::time::timeout(inner.config.load_timeout(), fut).await {
                Ok(Ok(bytes)) => Ok(bytes),
                Ok(Err(e)) => Err(LoadError::Source(Box::new(e))),
                Err(_elapsed) => Err(LoadError::Source(Box::new(LoadTimeoutError))),
            }
        };

        if let Some(token) = held_lock.take() {
            if let Some(lock_impl) = inner.lock.clone() {
                Self::release_detached(lock_impl, token);
            }
        }

        let value = source_result?;

        // Step 8: write-back, detached from the caller's cancellation with
        // its own independent timeout.
        Self::spawn_write_back(inner.clone(), lookup, value.clone(), ttl);

        Ok(value)
    }

    /// Step 7: bounded exponential-backoff wait-and-retry loop, used while
    /// the distributed lock is contended.
    async fn wait_and_retry(
        inner: &Arc<Inner>,
        lookup: &Lookup,
        cancel: &CancellationToken,
    ) -> Result<Option<Bytes>, LoadError> {
        let max_attempts = inner.config.max_retry_attempts();
        let deadline = tokio::time::Instant::now() + inner.config.dist_lock_ttl();

        let mut attempt: u32 = 0;
        while attempt < max_attempts && tokio::time::Instant::now() < deadline {
            let base_ms = 50u64.saturating_mul(1u64 << attempt.min(4));
            let capped_ms = base_ms.min(500);
            let jitter_frac = rand::thread_rng().gen_range(-0.15..=0.15);
            let wait_ms = ((capped_ms as f64) * (1.0 + jitter_frac)).max(0.0) as u64;

            tokio::select! {
                _ = cancel.cancelled() => return Err(LoadError::Cancelled),
                _ = tokio::time::sleep(Duration::from_millis(wait_ms)) => {}
            }

            match Self::store_read(inner.store.as_ref(), lookup).await {
                Ok(Some(value)) => return Ok(Some(value)),
                Ok(None) => {}
                // A non-miss transport error falls through to the source
                // call directly, same as exhausting the retry budget.
                Err(_) => return Ok(None),
            }
            attempt += 1;
        }
        Ok(None)
    }

    fn release_detached(lock_impl: Arc<dyn DistributedLock>, token: LockToken) {
        tokio::spawn(async move {
            let name = token.name().to_string();
            match tokio::time::timeout(Duration::from_secs(5), lock_impl.release(token)).await {
                Ok(Ok(())) => {}
                Ok(Err(LockError::Expired)) => {
                    tracing::info!(lock = %name, "lock release found it already expired or stolen");
                }
                Ok(Err(e)) => tracing::warn!(lock = %name, error = %e, "lock release failed"),
                Err(_) => tracing::warn!(lock = %name, "lock release timed out"),
            }
        });
    }

    fn spawn_write_back(inner: Arc<Inner>, lookup: Lookup, value: Bytes, ttl: Ttl) {
        tokio::spawn(async move {
            let effective_ttl = Self::jittered_ttl(ttl, inner.config.ttl_jitter());
            let write = Self::store_write(
                inner.store.as_ref(),
                &lookup,
                value,
                effective_ttl,
                inner.config.hash_ttl_refresh(),
            );

            match tokio::time::timeout(Duration::from_secs(30), write).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    inner.stats.write_failures.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(error = %e, "cache write-back failed");
                    if let Some(hook) = inner.config.on_cache_write_error() {
                        hook(&e);
                    }
                }
                Err(_) => {
                    inner.stats.write_failures.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!("cache write-back timed out");
                }
            }
        });
    }

    fn jittered_ttl(ttl: Ttl, jitter: f64) -> Ttl {
        match ttl {
            Ttl::Seconds(secs) if jitter > 0.0 => {
                let r: f64 = rand::thread_rng().gen_range(0.0..1.0);
                let factor = 1.0 + jitter * (r - 0.5);
                let jittered = ((secs as f64) * factor).max(1.0);
                Ttl::Seconds(jittered.round() as u64)
            }
            other => other,
        }
    }
}
