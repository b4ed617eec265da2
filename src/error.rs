//! Error taxonomy for the cache-aside loader.
//!
//! Every public entry point returns one of the closed error sets below;
//! callers match on variants rather than strings.

use thiserror::Error;

/// Errors surfaced by the Redis-backed store facade.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Transport-level failure talking to the backing store.
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// The store was closed and rejects further operations.
    #[error("store is closed")]
    Closed,
}

/// Errors surfaced by the distributed lock primitive.
#[derive(Error, Debug)]
pub enum LockError {
    /// The lock is currently held by another acquirer.
    #[error("lock is contended")]
    Contended,

    /// `ttl` was zero or negative at acquisition time.
    #[error("lock ttl must be positive")]
    InvalidTtl,

    /// The stored token no longer matched ours at release time: expired or
    /// stolen. Not fatal — logged at `info`, never escalated.
    #[error("lock expired or was stolen before release")]
    Expired,

    /// Underlying store failure while acquiring or releasing.
    #[error("lock backend error: {0}")]
    Store(#[from] StoreError),
}

/// Errors surfaced while building a [`crate::config::LoaderConfig`].
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A catch-all for invariant violations not worth a dedicated variant.
    #[error("invalid loader configuration: {0}")]
    Invalid(String),

    /// `DistLockTTL` did not exceed `LoadTimeout` while distributed locking
    /// and a positive load timeout are both in effect.
    #[error("lock ttl must be positive and exceed the load timeout")]
    InvalidLockTtl,
}

/// The recovered payload of a panicking `LoadFn`.
///
/// Renders as the original message when the panic value was a `&str` or
/// `String`, otherwise as a fixed placeholder — the payload itself is not
/// `Send`-safe to downcast further than that.
#[derive(Debug, Clone)]
pub struct PanicPayload(pub String);

impl std::fmt::Display for PanicPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl PanicPayload {
    /// Build a payload from a caught panic's `Box<dyn Any + Send>`.
    pub fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        if let Some(s) = payload.downcast_ref::<&str>() {
            Self(s.to_string())
        } else if let Some(s) = payload.downcast_ref::<String>() {
            Self(s.clone())
        } else {
            Self("non-string panic payload".to_string())
        }
    }
}

/// Errors returned by [`crate::loader::Loader::load`] and
/// [`crate::loader::Loader::load_hash`].
#[derive(Error, Debug)]
pub enum LoadError {
    /// `key` (or `field`, for hash loads) was empty.
    #[error("empty cache key or hash field")]
    EmptyKey,

    /// The loader's store facade has been closed.
    #[error("loader is closed")]
    Closed,

    /// The caller-supplied load function panicked.
    #[error("load function panicked: {0}")]
    Panic(PanicPayload),

    /// Configuration was invalid — only possible at construction.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A store operation on the fast or double-check path failed.
    #[error("cache store error: {0}")]
    Store(#[from] StoreError),

    /// The caller's own cancellation fired before completion.
    #[error("operation cancelled")]
    Cancelled,

    /// The caller-supplied load function returned an error.
    #[error("source load failed: {0}")]
    Source(Box<dyn std::error::Error + Send + Sync>),
}

/// Crate-local result alias for [`crate::loader::Loader::load`] and
/// [`crate::loader::Loader::load_hash`].
///
/// The error is `Arc`-wrapped because a single load's result — success or
/// failure — is broadcast to every caller deduplicated onto the same
/// in-flight worker (see [`crate::dedup::DedupGroup`]), and `LoadError`
/// itself is not `Clone` (it carries a boxed source error).
pub type LoadResult<T> = Result<T, std::sync::Arc<LoadError>>;
