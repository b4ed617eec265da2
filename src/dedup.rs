//! In-process keyed single-flight: for a given token, only one worker runs
//! at a time; concurrent callers for the same token attach to it and wait
//! independently, each free to abandon the wait on its own cancellation
//! while the worker keeps running for the others' benefit.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use tokio_util::sync::CancellationToken;

use crate::error::{LoadError, PanicPayload};

type SharedResult = Result<Bytes, Arc<LoadError>>;
type SharedWorker = Shared<BoxFuture<'static, SharedResult>>;

/// Keyed single-flight group. One instance backs an entire [`crate::loader::Loader`].
pub struct DedupGroup {
    inflight: Arc<DashMap<String, SharedWorker>>,
}

impl DedupGroup {
    /// Build an empty group.
    pub fn new() -> Self {
        Self {
            inflight: Arc::new(DashMap::new()),
        }
    }

    /// Run `worker` for `token`, deduplicating against any worker already
    /// in flight for the same token.
    ///
    /// `worker` itself is spawned onto its own `tokio` task the first time
    /// a token is seen — detached from `cancel` and from every other
    /// caller's cancellation — so it runs to completion exactly once
    /// regardless of how many callers abandon their own wait.
    pub async fn do_work<F, Fut>(
        &self,
        token: String,
        cancel: &CancellationToken,
        worker: F,
    ) -> SharedResult
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<Bytes, LoadError>> + Send + 'static,
    {
        let shared = match self.inflight.entry(token.clone()) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                let boxed: BoxFuture<'static, SharedResult> = Self::spawn_worker(worker).boxed();
                let shared = boxed.shared();
                entry.insert(shared.clone());
                self.spawn_janitor(token, shared.clone());
                shared
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Arc::new(LoadError::Cancelled)),
            result = shared => result,
        }
    }

    /// Number of tokens currently in flight. Exposed for tests.
    pub fn inflight_count(&self) -> usize {
        self.inflight.len()
    }

    fn spawn_janitor(&self, token: String, shared: SharedWorker) {
        let map = self.inflight.clone();
        tokio::spawn(async move {
            let _ = shared.await;
            map.remove(&token);
        });
    }

    /// Spawn the worker body onto its own task with a panic guard: any
    /// panic inside `worker` is caught before it can tear down the task
    /// (and, with it, the result channel every waiter depends on) and is
    /// translated into `LoadError::Panic`.
    async fn spawn_worker<F, Fut>(worker: F) -> SharedResult
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<Bytes, LoadError>> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            AssertUnwindSafe(worker()).catch_unwind().await
        });

        match handle.await {
            Ok(Ok(Ok(bytes))) => Ok(bytes),
            Ok(Ok(Err(e))) => Err(Arc::new(e)),
            Ok(Err(panic_payload)) => {
                Err(Arc::new(LoadError::Panic(PanicPayload::from_panic(panic_payload))))
            }
            Err(join_err) => Err(Arc::new(LoadError::Panic(PanicPayload(format!(
                "worker task did not complete: {join_err}"
            ))))),
        }
    }
}

impl Default for DedupGroup {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn concurrent_callers_invoke_worker_once() {
        let group = Arc::new(DedupGroup::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let group = group.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                let cancel = CancellationToken::new();
                group
                    .do_work("k".to_string(), &cancel, move || {
                        let calls = calls.clone();
                        async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                            Ok(Bytes::from_static(b"V"))
                        }
                    })
                    .await
            }));
        }

        for h in handles {
            let result = h.await.unwrap().unwrap();
            assert_eq!(result, Bytes::from_static(b"V"));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn entry_is_garbage_collected_after_completion() {
        let group = DedupGroup::new();
        let cancel = CancellationToken::new();
        group
            .do_work("k".to_string(), &cancel, || async { Ok(Bytes::from_static(b"V")) })
            .await
            .unwrap();
        // Allow the janitor task to run.
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(group.inflight_count(), 0);
    }

    #[tokio::test]
    async fn panicking_worker_yields_panic_error_without_crashing() {
        let group = DedupGroup::new();
        let cancel = CancellationToken::new();
        let result = group
            .do_work("k".to_string(), &cancel, || async {
                panic!("boom");
                #[allow(unreachable_code)]
                Ok(Bytes::new())
            })
            .await;
        match result {
            Err(e) => assert!(e.to_string().contains("boom")),
            Ok(_) => panic!("expected panic to surface as an error"),
        }
    }

    #[tokio::test]
    async fn cancelled_caller_returns_immediately_while_worker_continues() {
        let group = Arc::new(DedupGroup::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();

        let cancel_a = CancellationToken::new();
        let group_a = group.clone();
        let a = tokio::spawn(async move {
            group_a
                .do_work("k".to_string(), &cancel_a, move || {
                    let calls = calls2.clone();
                    async move {
                        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(Bytes::from_static(b"V"))
                    }
                })
                .await
        });

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        let cancel_b = CancellationToken::new();
        let group_b = group.clone();
        let b = tokio::spawn(async move {
            group_b
                .do_work("k".to_string(), &cancel_b, || async {
                    unreachable!("second caller must attach, not start its own worker")
                })
                .await
        });

        // Cancel A mid-flight; A's own cancellation must not affect B or the worker.
        tokio::time::sleep(std::time::Duration::from_millis(40)).await;
        cancel_a.cancel();

        let a_result = a.await.unwrap();
        assert!(matches!(a_result, Err(ref e) if matches!(**e, LoadError::Cancelled)));

        let b_result = b.await.unwrap().unwrap();
        assert_eq!(b_result, Bytes::from_static(b"V"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
