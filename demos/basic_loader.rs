//! Minimal demonstration of the cache-aside loader against a live Redis
//! instance. Not part of the published crate API — a thin wiring example,
//! not a tool in its own right.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use xcache::{LoaderConfig, Ttl};

type DemoError = Box<dyn std::error::Error>;

/// Small, optional demo-only configuration file. The crate itself never
/// reads configuration from disk — this is wiring for the demo binary
/// alone, not a feature of `xcache`.
#[derive(Deserialize)]
struct DemoConfig {
    #[serde(default = "default_redis_url")]
    redis_url: String,
    #[serde(default)]
    ttl_jitter: f64,
}

fn default_redis_url() -> String {
    "redis://127.0.0.1/".to_string()
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            redis_url: default_redis_url(),
            ttl_jitter: 0.1,
        }
    }
}

fn load_demo_config() -> Result<DemoConfig, DemoError> {
    match std::env::var("XCACHE_DEMO_CONFIG") {
        Ok(path) => {
            let raw = std::fs::read_to_string(path)?;
            Ok(serde_json::from_str(&raw)?)
        }
        Err(_) => Ok(DemoConfig::default()),
    }
}

#[tokio::main]
async fn main() -> Result<(), DemoError> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new("info"))
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let demo_config = load_demo_config()?;

    tracing::info!(redis_url = %demo_config.redis_url, "connecting to redis");
    let store = Arc::new(xcache::store::RedisStore::connect(&demo_config.redis_url).await?);

    let config = LoaderConfig::builder()
        .dedup_enabled(true)
        .ttl_jitter(demo_config.ttl_jitter)
        .build()?;

    let loader = xcache::Loader::new(store, None, config)?;
    let cancel = CancellationToken::new();

    let value = loader
        .load("demo:greeting", Ttl::Seconds(60), &cancel, |_cancel| async {
            tracing::info!("cache miss — invoking source");
            Ok::<_, std::convert::Infallible>(Bytes::from_static(b"hello from the origin"))
        })
        .await
        .map_err(|e| format!("load failed: {e}"))?;

    tracing::info!(value = %String::from_utf8_lossy(&value), "loaded");
    tracing::info!(stats = ?loader.stats(), "loader stats");

    // A second call within the TTL window should hit the cache and never
    // invoke the source closure again.
    let value = loader
        .load("demo:greeting", Ttl::Seconds(60), &cancel, |_cancel| async {
            unreachable!("source must not run on a cache hit")
        })
        .await
        .map_err(|e| format!("load failed: {e}"))?;

    tracing::info!(value = %String::from_utf8_lossy(&value), "loaded again (cache hit)");

    tokio::time::sleep(Duration::from_millis(50)).await;
    Ok(())
}
