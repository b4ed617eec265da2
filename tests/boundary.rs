//! Boundary behaviors from the specification's testable-properties section:
//! negative TTL passes through without a write, zero TTL persists with no
//! expiry, an empty value round-trips as a hit, invalid lock/load-timeout
//! configurations are rejected at construction, and retry attempts clamp.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use xcache::testing::MockStore;
use xcache::{ConfigError, LoaderConfig, Store, Ttl};

#[tokio::test]
async fn negative_ttl_invokes_source_but_performs_no_write() {
    let store = Arc::new(MockStore::new());
    let config = LoaderConfig::builder().build().unwrap();
    let loader = xcache::Loader::new(store.clone(), None, config).unwrap();
    let cancel = CancellationToken::new();

    let value = loader
        .load("k", Ttl::NoStore, &cancel, |_c| async {
            Ok::<_, std::convert::Infallible>(Bytes::from_static(b"V"))
        })
        .await
        .unwrap();
    assert_eq!(value, Bytes::from_static(b"V"));

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(store.get("k").await.unwrap(), None, "pass-through ttl must not write");
}

#[tokio::test]
async fn zero_ttl_persists_with_no_expiry() {
    let store = Arc::new(MockStore::new());
    let config = LoaderConfig::builder().build().unwrap();
    let loader = xcache::Loader::new(store.clone(), None, config).unwrap();
    let cancel = CancellationToken::new();

    loader
        .load("k", Ttl::Persist, &cancel, |_c| async {
            Ok::<_, std::convert::Infallible>(Bytes::from_static(b"V"))
        })
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(store.get("k").await.unwrap(), Some(Bytes::from_static(b"V")));
    assert_eq!(store.remaining_ttl("k"), None, "persist must not set an expiry");
}

#[tokio::test]
async fn empty_value_is_a_legitimate_hit_not_a_miss() {
    let store = Arc::new(MockStore::new());
    let config = LoaderConfig::builder().build().unwrap();
    let loader = xcache::Loader::new(store, None, config).unwrap();
    let cancel = CancellationToken::new();

    let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let calls2 = calls.clone();
    loader
        .load("k", Ttl::Seconds(60), &cancel, move |_c| {
            let calls = calls2.clone();
            async move {
                calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Ok::<_, std::convert::Infallible>(Bytes::new())
            }
        })
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;

    let value = loader
        .load("k", Ttl::Seconds(60), &cancel, move |_c| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Ok::<_, std::convert::Infallible>(Bytes::from_static(b"should not run"))
            }
        })
        .await
        .unwrap();

    assert_eq!(value, Bytes::new());
    assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1, "empty value must count as a hit");
}

#[test]
fn dist_lock_ttl_not_exceeding_load_timeout_fails_construction() {
    let result = LoaderConfig::builder()
        .dist_lock_enabled(true)
        .dist_lock_ttl(Duration::from_secs(5))
        .load_timeout(Duration::from_secs(30))
        .build();
    assert!(matches!(result, Err(ConfigError::InvalidLockTtl)));
}

#[test]
fn max_retry_attempts_above_one_thousand_clamps() {
    let cfg = LoaderConfig::builder().max_retry_attempts(5000).build().unwrap();
    assert_eq!(cfg.max_retry_attempts(), 1000);
}
