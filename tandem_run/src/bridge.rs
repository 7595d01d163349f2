//! Awaiting values across the two worlds.
//!
//! [`await_legacy`] lets structured code await a [`Deferred`];
//! [`BridgeManager::await_structured`] hands a structured future to legacy
//! code as a [`Deferred`]. Either way the source outcome is delivered exactly
//! once, failures included.

use std::future::Future;
use std::sync::Arc;

use futures::channel::oneshot;
use parking_lot::Mutex;
use tracing::debug;

use crate::error::{Error, Failure, Result};
use crate::fork::fork;
use crate::legacy::Deferred;
use crate::runtime::BridgeManager;

/// Awaits a legacy deferred from structured code.
///
/// Needs no running bridge. If the deferred's resolver is dropped unsettled
/// the result is a cancellation failure.
pub async fn await_legacy<T>(source: &Deferred<T>) -> Result<T, Failure>
where
    T: Clone + Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    let tx = Arc::new(Mutex::new(Some(tx)));
    let on_err = tx.clone();
    source.add_callbacks(
        move |value| {
            if let Some(tx) = tx.lock().take() {
                let _ = tx.send(Ok(value));
            }
        },
        move |failure| {
            if let Some(tx) = on_err.lock().take() {
                let _ = tx.send(Err(failure));
            }
        },
    );
    rx.await
        .unwrap_or_else(|_| Err(Failure::new(Error::Cancelled)))
}

impl BridgeManager {
    /// Runs `source` in the running bridge's scope and returns a deferred
    /// that settles with its outcome.
    ///
    /// Fails with [`Error::NotRunning`] if no bridge is running. If the bridge
    /// stops before `source` completes, the deferred fails with a
    /// cancellation failure.
    pub fn await_structured<T, Fut>(&self, source: Fut) -> Result<Deferred<T>>
    where
        T: Clone + Send + 'static,
        Fut: Future<Output = Result<T, Failure>> + Send + 'static,
    {
        let session = self.session()?;
        let (deferred, resolver) = Deferred::pending();
        let wake = session.wake.clone();
        debug!(scope = session.scope.id(), "structured future handed to legacy code");
        fork(&session.scope, move |_cx| async move {
            let outcome = source.await;
            resolver.settle(outcome);
            wake.notify();
            Ok(())
        });
        Ok(deferred)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::legacy::LegacyReactor;

    #[tokio::test]
    async fn legacy_value_reaches_structured_code() {
        let (deferred, resolver) = Deferred::pending();
        let waiter = tokio::spawn({
            let deferred = deferred.clone();
            async move { await_legacy(&deferred).await }
        });
        tokio::task::yield_now().await;
        resolver.resolve(String::from("ready"));
        assert_eq!(waiter.await.expect("join").expect("value"), "ready");
    }

    #[tokio::test]
    async fn legacy_failure_is_the_same_failure() {
        let failure = Failure::msg("disk on fire");
        let deferred = Deferred::<u8>::failed(failure.clone());
        let seen = await_legacy(&deferred).await.expect_err("failure");
        assert!(seen.ptr_eq(&failure));
    }

    #[tokio::test]
    async fn abandoned_deferred_is_a_cancellation() {
        let (deferred, resolver) = Deferred::<u8>::pending();
        drop(resolver);
        assert!(await_legacy(&deferred).await.expect_err("cancelled").is_cancelled());
    }

    #[test]
    fn structured_without_a_bridge_is_rejected() {
        let manager = BridgeManager::new(Arc::new(LegacyReactor::new()));
        let err = manager
            .await_structured(async { Ok::<_, Failure>(1u8) })
            .expect_err("not running");
        assert!(matches!(err, Error::NotRunning));
    }

    #[tokio::test]
    async fn stopping_the_bridge_cancels_pending_structured_work() {
        let manager = BridgeManager::new(Arc::new(LegacyReactor::new()));
        let running = manager.start().expect("start");
        let pending = manager
            .await_structured(futures::future::pending::<Result<u8, Failure>>())
            .expect("forked");
        running
            .drive(Deferred::succeeded(()))
            .await
            .expect("stopped");
        let failure = pending.result().expect("settled").expect_err("cancelled");
        assert!(failure.is_cancelled());
    }
}
