//! Loader configuration.
//!
//! `LoaderConfig` is immutable once built; [`LoaderConfigBuilder::build`]
//! performs the validation the specification requires at construction time
//! rather than at first use.

use std::sync::Arc;
use std::time::Duration;

use crate::error::ConfigError;
use crate::lock::DistributedLock;

/// Tri-valued time-to-live, matching the store write-policy in the wire
/// protocol: positive seconds, `0` for "no expiry", negative for
/// "pass-through, do not store".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ttl {
    /// Store with the given expiration.
    Seconds(u64),
    /// Store with no expiration.
    Persist,
    /// Do not store at all.
    NoStore,
}

impl Ttl {
    /// Build a `Ttl` from a signed seconds count, matching the `>0`/`=0`/`<0`
    /// trichotomy from the wire protocol.
    pub fn from_secs_signed(secs: i64) -> Self {
        match secs.cmp(&0) {
            std::cmp::Ordering::Greater => Ttl::Seconds(secs as u64),
            std::cmp::Ordering::Equal => Ttl::Persist,
            std::cmp::Ordering::Less => Ttl::NoStore,
        }
    }

    /// Whether this TTL calls for a store write at all.
    pub fn should_store(&self) -> bool {
        !matches!(self, Ttl::NoStore)
    }
}

impl From<Duration> for Ttl {
    fn from(d: Duration) -> Self {
        if d.is_zero() {
            Ttl::Persist
        } else {
            Ttl::Seconds(d.as_secs().max(1))
        }
    }
}

/// Synchronous hook invoked whenever a best-effort cache write fails.
///
/// Must return promptly: it runs inline on the write-back task.
pub type OnCacheWriteError = Arc<dyn Fn(&crate::error::StoreError) + Send + Sync>;

/// Immutable, validated loader configuration.
#[derive(Clone)]
pub struct LoaderConfig {
    pub(crate) dedup_enabled: bool,
    pub(crate) dist_lock_enabled: bool,
    pub(crate) dist_lock_ttl: Duration,
    pub(crate) dist_lock_prefix: String,
    pub(crate) external_lock: Option<Arc<dyn DistributedLock>>,
    pub(crate) load_timeout: Duration,
    pub(crate) max_retry_attempts: u32,
    pub(crate) ttl_jitter: f64,
    pub(crate) hash_ttl_refresh: bool,
    pub(crate) on_cache_write_error: Option<OnCacheWriteError>,
}

const DEFAULT_DIST_LOCK_TTL: Duration = Duration::from_secs(45);
const DEFAULT_LOAD_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_MAX_RETRY_ATTEMPTS: u32 = 10;
const MAX_RETRY_ATTEMPTS_CEILING: u32 = 1000;

impl LoaderConfig {
    /// Start building a configuration from the documented defaults.
    pub fn builder() -> LoaderConfigBuilder {
        LoaderConfigBuilder::default()
    }

    /// Whether in-process single-flight deduplication is enabled.
    pub fn dedup_enabled(&self) -> bool {
        self.dedup_enabled
    }

    /// Whether the distributed lock is engaged around the source call.
    pub fn dist_lock_enabled(&self) -> bool {
        self.dist_lock_enabled
    }

    /// The distributed lock's TTL.
    pub fn dist_lock_ttl(&self) -> Duration {
        self.dist_lock_ttl
    }

    /// The prefix prepended to every lock name this loader acquires.
    pub fn dist_lock_prefix(&self) -> &str {
        &self.dist_lock_prefix
    }

    /// The per-source-call timeout; `Duration::ZERO` means disabled.
    pub fn load_timeout(&self) -> Duration {
        self.load_timeout
    }

    /// The maximum number of wait-and-retry iterations under lock
    /// contention.
    pub fn max_retry_attempts(&self) -> u32 {
        self.max_retry_attempts
    }

    /// The TTL jitter fraction, in `[0, 1]`.
    pub fn ttl_jitter(&self) -> f64 {
        self.ttl_jitter
    }

    /// Whether a hash-field write refreshes the hash's overall expiry.
    pub fn hash_ttl_refresh(&self) -> bool {
        self.hash_ttl_refresh
    }

    /// An externally supplied lock implementation, if configured in place
    /// of the loader's own Redis-backed lock.
    pub fn external_lock(&self) -> Option<&Arc<dyn DistributedLock>> {
        self.external_lock.as_ref()
    }

    /// The write-failure hook, if configured.
    pub fn on_cache_write_error(&self) -> Option<&OnCacheWriteError> {
        self.on_cache_write_error.as_ref()
    }
}

/// Builder for [`LoaderConfig`].
pub struct LoaderConfigBuilder {
    dedup_enabled: bool,
    dist_lock_enabled: bool,
    dist_lock_ttl: Duration,
    dist_lock_prefix: String,
    external_lock: Option<Arc<dyn DistributedLock>>,
    load_timeout: Duration,
    max_retry_attempts: u32,
    ttl_jitter: f64,
    hash_ttl_refresh: bool,
    on_cache_write_error: Option<OnCacheWriteError>,
}

impl Default for LoaderConfigBuilder {
    fn default() -> Self {
        Self {
            dedup_enabled: true,
            dist_lock_enabled: false,
            dist_lock_ttl: DEFAULT_DIST_LOCK_TTL,
            dist_lock_prefix: "loader:".to_string(),
            external_lock: None,
            load_timeout: DEFAULT_LOAD_TIMEOUT,
            max_retry_attempts: DEFAULT_MAX_RETRY_ATTEMPTS,
            ttl_jitter: 0.0,
            hash_ttl_refresh: true,
            on_cache_write_error: None,
        }
    }
}

impl LoaderConfigBuilder {
    /// Enable or disable in-process single-flight deduplication.
    pub fn dedup_enabled(mut self, enabled: bool) -> Self {
        self.dedup_enabled = enabled;
        self
    }

    /// Enable the distributed lock using the loader's own Redis-backed
    /// implementation.
    pub fn dist_lock_enabled(mut self, enabled: bool) -> Self {
        self.dist_lock_enabled = enabled;
        self
    }

    /// Set the distributed lock's TTL.
    pub fn dist_lock_ttl(mut self, ttl: Duration) -> Self {
        self.dist_lock_ttl = ttl;
        self
    }

    /// Set the prefix prepended to every lock name.
    pub fn dist_lock_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.dist_lock_prefix = prefix.into();
        self
    }

    /// Supply an externally implemented lock, implicitly enabling
    /// distributed locking.
    pub fn external_lock(mut self, lock: Arc<dyn DistributedLock>) -> Self {
        self.external_lock = Some(lock);
        self.dist_lock_enabled = true;
        self
    }

    /// Set the per-source-call timeout. `Duration::ZERO` disables it.
    pub fn load_timeout(mut self, timeout: Duration) -> Self {
        self.load_timeout = timeout;
        self
    }

    /// Set the maximum wait-and-retry iteration count under lock
    /// contention; clamped to `[1, 1000]` at `build()`.
    pub fn max_retry_attempts(mut self, attempts: u32) -> Self {
        self.max_retry_attempts = attempts;
        self
    }

    /// Set the TTL jitter fraction; clamped to `[0, 1]` at `build()`.
    pub fn ttl_jitter(mut self, jitter: f64) -> Self {
        self.ttl_jitter = jitter;
        self
    }

    /// Whether a hash-field write refreshes the hash's overall expiry.
    pub fn hash_ttl_refresh(mut self, refresh: bool) -> Self {
        self.hash_ttl_refresh = refresh;
        self
    }

    /// Set the synchronous write-failure hook.
    pub fn on_cache_write_error(mut self, hook: OnCacheWriteError) -> Self {
        self.on_cache_write_error = Some(hook);
        self
    }

    /// Validate and freeze the configuration.
    ///
    /// # Errors
    /// Returns [`ConfigError::InvalidLockTtl`] if distributed locking is
    /// engaged with a positive load timeout that the lock TTL does not
    /// exceed.
    pub fn build(self) -> Result<LoaderConfig, ConfigError> {
        let max_retry_attempts = if self.max_retry_attempts == 0 {
            DEFAULT_MAX_RETRY_ATTEMPTS
        } else {
            self.max_retry_attempts.min(MAX_RETRY_ATTEMPTS_CEILING)
        };
        let ttl_jitter = self.ttl_jitter.clamp(0.0, 1.0);

        if self.dist_lock_enabled && !self.load_timeout.is_zero() {
            if self.dist_lock_ttl.is_zero() || self.dist_lock_ttl <= self.load_timeout {
                return Err(ConfigError::InvalidLockTtl);
            }
        }

        Ok(LoaderConfig {
            dedup_enabled: self.dedup_enabled,
            dist_lock_enabled: self.dist_lock_enabled,
            dist_lock_ttl: self.dist_lock_ttl,
            dist_lock_prefix: self.dist_lock_prefix,
            external_lock: self.external_lock,
            load_timeout: self.load_timeout,
            max_retry_attempts,
            ttl_jitter,
            hash_ttl_refresh: self.hash_ttl_refresh,
            on_cache_write_error: self.on_cache_write_error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_build_successfully() {
        let cfg = LoaderConfig::builder().build().unwrap();
        assert!(cfg.dedup_enabled());
        assert!(!cfg.dist_lock_enabled());
        assert_eq!(cfg.max_retry_attempts(), DEFAULT_MAX_RETRY_ATTEMPTS);
    }

    #[test]
    fn rejects_lock_ttl_not_exceeding_load_timeout() {
        let result = LoaderConfig::builder()
            .dist_lock_enabled(true)
            .dist_lock_ttl(Duration::from_secs(10))
            .load_timeout(Duration::from_secs(30))
            .build();
        assert!(matches!(result, Err(ConfigError::InvalidLockTtl)));
    }

    #[test]
    fn zero_load_timeout_skips_lock_ttl_check() {
        let result = LoaderConfig::builder()
            .dist_lock_enabled(true)
            .dist_lock_ttl(Duration::from_secs(1))
            .load_timeout(Duration::ZERO)
            .build();
        assert!(result.is_ok());
    }

    #[test]
    fn clamps_max_retry_attempts() {
        let cfg = LoaderConfig::builder()
            .max_retry_attempts(5000)
            .build()
            .unwrap();
        assert_eq!(cfg.max_retry_attempts(), MAX_RETRY_ATTEMPTS_CEILING);
    }

    #[test]
    fn clamps_ttl_jitter() {
        let cfg = LoaderConfig::builder().ttl_jitter(3.0).build().unwrap();
        assert_eq!(cfg.ttl_jitter(), 1.0);
    }

    #[test]
    fn ttl_trichotomy() {
        assert_eq!(Ttl::from_secs_signed(10), Ttl::Seconds(10));
        assert_eq!(Ttl::from_secs_signed(0), Ttl::Persist);
        assert_eq!(Ttl::from_secs_signed(-1), Ttl::NoStore);
    }
}
