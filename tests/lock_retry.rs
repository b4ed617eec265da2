//! Scenario 6: while the distributed lock is held elsewhere, a contending
//! loader must resolve via the wait-and-retry loop once the holder writes
//! and releases, without ever invoking its own source function.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use xcache::testing::{MockLock, MockStore};
use xcache::{LoaderConfig, Store, Ttl};

#[tokio::test]
async fn contended_lock_resolves_from_holder_write_without_calling_source() {
    let store = Arc::new(MockStore::new());
    let mock_lock = Arc::new(MockLock::new());
    mock_lock.seed_held("loader:k", Duration::from_millis(200)).await;
    let lock: Arc<dyn xcache::DistributedLock> = mock_lock;

    let config = LoaderConfig::builder()
        .dist_lock_enabled(true)
        .dist_lock_ttl(Duration::from_millis(200))
        .max_retry_attempts(10)
        .load_timeout(Duration::ZERO)
        .build()
        .unwrap();
    let loader = xcache::Loader::new(store.clone(), Some(lock), config).unwrap();
    let cancel = CancellationToken::new();

    let store_writer = store.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(90)).await;
        store_writer
            .set("k", Bytes::from_static(b"V"), Ttl::Seconds(60))
            .await
            .unwrap();
    });

    let called = Arc::new(AtomicUsize::new(0));
    let called2 = called.clone();
    let value = loader
        .load("k", Ttl::Seconds(3600), &cancel, move |_c| {
            let called = called2.clone();
            async move {
                called.fetch_add(1, Ordering::SeqCst);
                Ok::<_, std::convert::Infallible>(Bytes::from_static(b"SHOULD_NOT_RUN"))
            }
        })
        .await
        .unwrap();

    assert_eq!(value, Bytes::from_static(b"V"));
    assert_eq!(called.load(Ordering::SeqCst), 0);
}
