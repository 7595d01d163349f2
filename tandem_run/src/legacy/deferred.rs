//! Callback-style futures used by legacy reactor code.
//!
//! A [`Deferred`] is observed by attaching continuations; a [`Resolver`] settles
//! it exactly once. Continuations attached after settlement run immediately.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Error, Failure};

type OnOk<T> = Box<dyn FnOnce(T) + Send + 'static>;
type OnErr = Box<dyn FnOnce(Failure) + Send + 'static>;

enum State<T> {
    Pending(Vec<(OnOk<T>, OnErr)>),
    Settled(Result<T, Failure>),
}

/// A pending or settled legacy value.
///
/// Clones observe the same value.
pub struct Deferred<T> {
    state: Arc<Mutex<State<T>>>,
}

/// Settles the [`Deferred`] it was created with.
///
/// Dropping an unsettled resolver fails the deferred with
/// [`Error::Cancelled`].
pub struct Resolver<T> {
    state: Option<Arc<Mutex<State<T>>>>,
}

impl<T> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<T> Deferred<T>
where
    T: Clone + Send + 'static,
{
    /// Creates an unsettled deferred and its resolver.
    #[must_use]
    pub fn pending() -> (Self, Resolver<T>) {
        let state = Arc::new(Mutex::new(State::Pending(Vec::new())));
        (
            Self {
                state: state.clone(),
            },
            Resolver { state: Some(state) },
        )
    }

    /// A deferred that already holds `value`.
    #[must_use]
    pub fn succeeded(value: T) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::Settled(Ok(value)))),
        }
    }

    /// A deferred that already failed with `failure`.
    #[must_use]
    pub fn failed(failure: Failure) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::Settled(Err(failure)))),
        }
    }

    /// Attaches a success and a failure continuation. Exactly one of them runs.
    pub fn add_callbacks<S, F>(&self, on_ok: S, on_err: F)
    where
        S: FnOnce(T) + Send + 'static,
        F: FnOnce(Failure) + Send + 'static,
    {
        let settled = {
            let mut state = self.state.lock();
            match &mut *state {
                State::Pending(waiting) => {
                    waiting.push((Box::new(on_ok), Box::new(on_err)));
                    return;
                }
                State::Settled(result) => result.clone(),
            }
        };
        match settled {
            Ok(value) => on_ok(value),
            Err(failure) => on_err(failure),
        }
    }

    /// Attaches one continuation that receives either outcome.
    pub fn add_both<C>(&self, callback: C)
    where
        C: FnOnce(Result<T, Failure>) + Send + 'static,
    {
        let slot = Arc::new(Mutex::new(Some(callback)));
        let on_err = slot.clone();
        self.add_callbacks(
            move |value| {
                if let Some(callback) = slot.lock().take() {
                    callback(Ok(value));
                }
            },
            move |failure| {
                if let Some(callback) = on_err.lock().take() {
                    callback(Err(failure));
                }
            },
        );
    }

    /// Returns `true` once settled.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        matches!(&*self.state.lock(), State::Settled(_))
    }

    /// The outcome, if settled.
    #[must_use]
    pub fn result(&self) -> Option<Result<T, Failure>> {
        match &*self.state.lock() {
            State::Pending(_) => None,
            State::Settled(result) => Some(result.clone()),
        }
    }
}

impl<T> fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let resolved = matches!(&*self.state.lock(), State::Settled(_));
        f.debug_struct("Deferred")
            .field("resolved", &resolved)
            .finish()
    }
}

impl<T> Resolver<T>
where
    T: Clone + Send + 'static,
{
    /// Settles with a value.
    pub fn resolve(mut self, value: T) {
        self.settle_inner(Ok(value));
    }

    /// Settles with a failure.
    pub fn reject(mut self, failure: Failure) {
        self.settle_inner(Err(failure));
    }

    /// Settles with either outcome.
    pub fn settle(mut self, outcome: Result<T, Failure>) {
        self.settle_inner(outcome);
    }
}

impl<T> Resolver<T> {
    fn settle_inner(&mut self, outcome: Result<T, Failure>)
    where
        T: Clone,
    {
        let Some(state) = self.state.take() else {
            return;
        };
        let waiting = {
            let mut state = state.lock();
            match std::mem::replace(&mut *state, State::Settled(outcome.clone())) {
                State::Pending(waiting) => waiting,
                State::Settled(previous) => {
                    *state = State::Settled(previous);
                    return;
                }
            }
        };
        // Continuations run outside the lock so they may touch the deferred.
        for (on_ok, on_err) in waiting {
            match &outcome {
                Ok(value) => on_ok(value.clone()),
                Err(failure) => on_err(failure.clone()),
            }
        }
    }
}

impl<T> Drop for Resolver<T> {
    fn drop(&mut self) {
        let Some(state) = self.state.take() else {
            return;
        };
        let failure = Failure::new(Error::Cancelled);
        let waiting = {
            let mut state = state.lock();
            match std::mem::replace(&mut *state, State::Settled(Err(failure.clone()))) {
                State::Pending(waiting) => waiting,
                State::Settled(previous) => {
                    *state = State::Settled(previous);
                    return;
                }
            }
        };
        for (_, on_err) in waiting {
            on_err(failure.clone());
        }
    }
}

impl<T> fmt::Debug for Resolver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolver")
            .field("settled", &self.state.is_none())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn continuations_run_on_resolve() {
        let (deferred, resolver) = Deferred::<u32>::pending();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for _ in 0..2 {
            let seen = seen.clone();
            deferred.add_callbacks(move |v| seen.lock().push(v), |_| panic!("no failure"));
        }
        assert!(!deferred.is_resolved());

        resolver.resolve(7);
        assert_eq!(*seen.lock(), vec![7, 7]);
        assert_eq!(deferred.result().expect("settled").expect("value"), 7);
    }

    #[test]
    fn late_continuations_run_immediately() {
        let deferred = Deferred::<u32>::failed(Failure::msg("nope"));
        let failures = Arc::new(AtomicUsize::new(0));
        let count = failures.clone();
        deferred.add_callbacks(
            |_| panic!("no value"),
            move |f| {
                assert_eq!(f.to_string(), "nope");
                count.fetch_add(1, Ordering::SeqCst);
            },
        );
        assert_eq!(failures.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropped_resolver_cancels() {
        let (deferred, resolver) = Deferred::<()>::pending();
        let cancelled = Arc::new(AtomicUsize::new(0));
        let count = cancelled.clone();
        deferred.add_both(move |outcome| {
            assert!(outcome.expect_err("cancelled").is_cancelled());
            count.fetch_add(1, Ordering::SeqCst);
        });
        drop(resolver);
        assert_eq!(cancelled.load(Ordering::SeqCst), 1);
        assert!(deferred.result().expect("settled").is_err());
    }

    #[test]
    fn continuation_may_observe_its_deferred() {
        let (deferred, resolver) = Deferred::<u8>::pending();
        let observer = deferred.clone();
        let resolved = Arc::new(AtomicUsize::new(0));
        let count = resolved.clone();
        deferred.add_both(move |_| {
            if observer.is_resolved() {
                count.fetch_add(1, Ordering::SeqCst);
            }
        });
        resolver.resolve(1);
        assert_eq!(resolved.load(Ordering::SeqCst), 1);
    }

    proptest! {
        #[test]
        fn every_continuation_runs_exactly_once(
            attach_early in proptest::collection::vec(any::<bool>(), 0..16),
            succeed in any::<bool>(),
        ) {
            let (deferred, resolver) = Deferred::<u8>::pending();
            let runs = Arc::new(AtomicUsize::new(0));
            let attach = |deferred: &Deferred<u8>| {
                let ok = runs.clone();
                let err = runs.clone();
                deferred.add_callbacks(
                    move |_| {
                        ok.fetch_add(1, Ordering::SeqCst);
                    },
                    move |_| {
                        err.fetch_add(1, Ordering::SeqCst);
                    },
                );
            };

            for _ in attach_early.iter().filter(|early| **early) {
                attach(&deferred);
            }
            if succeed {
                resolver.resolve(1);
            } else {
                resolver.reject(Failure::msg("rejected"));
            }
            for _ in attach_early.iter().filter(|early| !**early) {
                attach(&deferred);
            }

            prop_assert_eq!(runs.load(Ordering::SeqCst), attach_early.len());
            prop_assert_eq!(deferred.result().map(|r| r.is_ok()), Some(succeed));
        }
    }
}
