//! With deduplication disabled, `Load` continues inline with the caller's
//! own context (spec.md §4.4 step 3): the caller's cancellation must still
//! be honored promptly rather than being checked once and then ignored for
//! the rest of the call.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use xcache::testing::MockStore;
use xcache::{LoadError, LoaderConfig, Ttl};

#[tokio::test]
async fn caller_cancellation_is_honored_promptly_without_dedup() {
    let store = Arc::new(MockStore::new());
    let config = LoaderConfig::builder()
        .dedup_enabled(false)
        .load_timeout(Duration::ZERO)
        .build()
        .unwrap();
    let loader = xcache::Loader::new(store, None, config).unwrap();
    let cancel = CancellationToken::new();

    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel_clone.cancel();
    });

    let started = Instant::now();
    let result = loader
        .load("k", Ttl::Seconds(3600), &cancel, |_c| async {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok::<_, std::convert::Infallible>(Bytes::from_static(b"V"))
        })
        .await;

    let elapsed = started.elapsed();
    assert!(
        matches!(result, Err(ref e) if matches!(**e, LoadError::Cancelled)),
        "expected Cancelled, got {result:?}"
    );
    assert!(
        elapsed < Duration::from_millis(300),
        "cancellation was not honored promptly: took {elapsed:?}"
    );
}
