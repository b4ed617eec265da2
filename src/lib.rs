//! # xcache — cache-aside loader
//!
//! A concurrency-safe, panic-safe, single-flight-deduplicated,
//! optionally distributed-lock-protected facade over a Redis-compatible
//! key/value store implementing the read-through (cache-aside) pattern
//! for both flat keys and hash fields.
//!
//! ## Architecture
//!
//! - `key`: validated `CacheKey`/`HashField` types and the collision-free
//!   composite dedup/lock token encoding.
//! - `config`: immutable, validated `LoaderConfig`.
//! - `store`: the minimal backing-store contract (`Store`) and its
//!   Redis-backed implementation.
//! - `lock`: the distributed mutual-exclusion primitive
//!   (`DistributedLock`) and its Redis-backed implementation.
//! - `dedup`: in-process keyed single-flight.
//! - `loader`: the engine that ties the above together behind
//!   `Loader::load` / `Loader::load_hash`.
//! - `testing`: in-memory test doubles for `Store` and `DistributedLock`.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Validated key/field types and composite token encoding.
pub mod key;

/// Immutable, validated loader configuration.
pub mod config;

/// Closed error taxonomy.
pub mod error;

/// Backing-store contract and Redis implementation.
pub mod store;

/// Distributed mutual-exclusion primitive.
pub mod lock;

/// In-process keyed single-flight.
pub mod dedup;

/// The loader engine.
pub mod loader;

/// In-memory test doubles. Gated behind the `testing` feature so the
/// `uuid`/`dashmap`-backed mocks are not part of the default public API
/// surface; enabled automatically for this crate's own integration tests
/// via the `dev-dependencies` self-reference in `Cargo.toml`.
#[cfg(feature = "testing")]
pub mod testing;

pub use config::{LoaderConfig, LoaderConfigBuilder, Ttl};
pub use error::{ConfigError, LoadError, LoadResult, LockError, StoreError};
pub use key::{CacheKey, HashField, Lookup};
pub use loader::{Loader, LoaderStats};
pub use lock::{DistributedLock, LockToken};
pub use store::{Store, TtlStatus};

/// Re-export version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Re-export crate name
pub const NAME: &str = env!("CARGO_PKG_NAME");
