//! Scenario 4 / testable property 5: a jittered TTL write must land within
//! `[ttl*(1-J/2), ttl*(1+J/2)]`.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use proptest::prelude::*;
use tokio_util::sync::CancellationToken;
use xcache::testing::MockStore;
use xcache::{LoaderConfig, Ttl};

#[tokio::test]
async fn six_hundred_second_ttl_with_half_jitter_stays_in_bounds() {
    let store = Arc::new(MockStore::new());
    let config = LoaderConfig::builder().ttl_jitter(0.5).build().unwrap();
    let loader = xcache::Loader::new(store.clone(), None, config).unwrap();
    let cancel = CancellationToken::new();

    loader
        .load("k", Ttl::Seconds(600), &cancel, |_c| async {
            Ok::<_, std::convert::Infallible>(Bytes::from_static(b"V"))
        })
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;

    let remaining = store.remaining_ttl("k").expect("key must have a recorded ttl");
    assert!(remaining >= Duration::from_secs(450), "{remaining:?} below lower bound");
    assert!(remaining <= Duration::from_secs(750), "{remaining:?} above upper bound");
}

proptest! {
    #[test]
    fn jittered_ttl_always_within_bounds(secs in 10u64..100_000, jitter in 0.0f64..1.0) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let store = Arc::new(MockStore::new());
            let config = LoaderConfig::builder().ttl_jitter(jitter).build().unwrap();
            let loader = xcache::Loader::new(store.clone(), None, config).unwrap();
            let cancel = CancellationToken::new();

            loader
                .load("k", Ttl::Seconds(secs), &cancel, |_c| async {
                    Ok::<_, std::convert::Infallible>(Bytes::from_static(b"V"))
                })
                .await
                .unwrap();

            tokio::time::sleep(Duration::from_millis(10)).await;

            let remaining = store.remaining_ttl("k").unwrap();
            let lower = (secs as f64) * (1.0 - jitter / 2.0);
            let upper = (secs as f64) * (1.0 + jitter / 2.0);
            // Allow a one-second slack for rounding and the real clock tick
            // elapsed between write and assertion.
            prop_assert!(remaining.as_secs_f64() >= lower - 1.0);
            prop_assert!(remaining.as_secs_f64() <= upper + 1.0);
        });
    }
}
