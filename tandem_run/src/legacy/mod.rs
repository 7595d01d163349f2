//! The legacy reactor interface.
//!
//! Legacy code talks to a [`LegacyReactor`]: it registers callbacks for
//! descriptor readiness and timers, and runs the main loop until a
//! [`Deferred`] settles. The reactor forwards registrations to whichever
//! [`ReactorEngine`] is installed and drives the loop through the engine's
//! [`ReactorEngine::iterate`] step.

mod deferred;

pub use deferred::{Deferred, Resolver};

use std::fmt;
use std::os::fd::RawFd;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use crossbeam_queue::SegQueue;
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error};

use crate::error::{Error, Failure, Result};
use crate::fork::CancelHandle;
use crate::wake::WakeSignal;

/// A zero-argument legacy callback. Returning `Err` reports a fault.
pub type LegacyCallback = Box<dyn FnMut() -> Result<(), Failure> + Send + 'static>;

type QueuedCall = Box<dyn FnOnce() -> Result<(), Failure> + Send + 'static>;

/// What an engine must provide to host legacy code.
pub trait ReactorEngine: Send + Sync {
    /// Calls `callback` each time `fd` is readable, until cancelled.
    fn register_readable(&self, fd: RawFd, callback: LegacyCallback) -> Result<CancelHandle>;

    /// Calls `callback` each time `fd` is writable, until cancelled.
    fn register_writable(&self, fd: RawFd, callback: LegacyCallback) -> Result<CancelHandle>;

    /// Calls `callback` after `delay`, and then every `delay` if `repeat`.
    fn register_timer(
        &self,
        delay: Duration,
        repeat: bool,
        callback: LegacyCallback,
    ) -> Result<CancelHandle>;

    /// One step of the main loop.
    ///
    /// With `block == false` this only yields to other ready work. With
    /// `block == true` it suspends until the engine is woken.
    ///
    /// Engines register for the wake when `iterate` is called, not when the
    /// returned future is first polled, so a caller may create the step,
    /// check its exit condition, and only then await the step.
    ///
    /// A wake that arrives while no blocking step exists is not remembered.
    /// Callers must therefore re-check their own exit condition after every
    /// return from `iterate` instead of assuming that a return means their
    /// condition changed.
    fn iterate(&self, block: bool) -> BoxFuture<'_, ()>;
}

/// The facade legacy code registers with.
pub struct LegacyReactor {
    engine: RwLock<Option<Arc<dyn ReactorEngine>>>,
    queued: SegQueue<QueuedCall>,
    // Fired when legacy work is resumed from outside the main loop.
    wake_hook: Mutex<Option<WakeSignal>>,
}

impl LegacyReactor {
    /// Creates a reactor with no engine installed.
    #[must_use]
    pub fn new() -> Self {
        Self {
            engine: RwLock::new(None),
            queued: SegQueue::new(),
            wake_hook: Mutex::new(None),
        }
    }

    /// The process-wide reactor.
    pub fn global() -> &'static Arc<LegacyReactor> {
        static GLOBAL: OnceLock<Arc<LegacyReactor>> = OnceLock::new();
        GLOBAL.get_or_init(|| Arc::new(LegacyReactor::new()))
    }

    /// Makes `engine` the active engine, returning the one it replaces.
    pub fn install(&self, engine: Arc<dyn ReactorEngine>) -> Option<Arc<dyn ReactorEngine>> {
        debug!("reactor engine installed");
        self.engine.write().replace(engine)
    }

    /// Removes the active engine.
    pub fn uninstall(&self) -> Option<Arc<dyn ReactorEngine>> {
        debug!("reactor engine uninstalled");
        self.engine.write().take()
    }

    /// Puts `previous` back as the active engine, or clears it.
    pub(crate) fn restore(&self, previous: Option<Arc<dyn ReactorEngine>>) {
        *self.engine.write() = previous;
    }

    /// Sets the signal fired by [`LegacyReactor::call_soon`] and
    /// [`LegacyReactor::pause`], returning the one it replaces.
    pub(crate) fn set_wake_hook(&self, hook: Option<WakeSignal>) -> Option<WakeSignal> {
        std::mem::replace(&mut *self.wake_hook.lock(), hook)
    }

    fn fire_wake_hook(&self) {
        let hook = self.wake_hook.lock().clone();
        if let Some(hook) = hook {
            hook.notify();
        }
    }

    /// Returns `true` if an engine is installed.
    #[must_use]
    pub fn has_engine(&self) -> bool {
        self.engine.read().is_some()
    }

    fn engine(&self) -> Result<Arc<dyn ReactorEngine>> {
        self.engine.read().clone().ok_or(Error::NotRunning)
    }

    /// Calls `callback` whenever `fd` is readable.
    pub fn add_reader<C>(&self, fd: RawFd, callback: C) -> Result<CancelHandle>
    where
        C: FnMut() -> Result<(), Failure> + Send + 'static,
    {
        self.engine()?.register_readable(fd, Box::new(callback))
    }

    /// Calls `callback` whenever `fd` is writable.
    pub fn add_writer<C>(&self, fd: RawFd, callback: C) -> Result<CancelHandle>
    where
        C: FnMut() -> Result<(), Failure> + Send + 'static,
    {
        self.engine()?.register_writable(fd, Box::new(callback))
    }

    /// Calls `callback` once after `delay`.
    pub fn call_later<C>(&self, delay: Duration, callback: C) -> Result<CancelHandle>
    where
        C: FnOnce() -> Result<(), Failure> + Send + 'static,
    {
        let mut callback = Some(callback);
        self.engine()?.register_timer(
            delay,
            false,
            Box::new(move || callback.take().map_or(Ok(()), |call| call())),
        )
    }

    /// Calls `callback` every `interval`, starting one interval from now.
    pub fn call_every<C>(&self, interval: Duration, callback: C) -> Result<CancelHandle>
    where
        C: FnMut() -> Result<(), Failure> + Send + 'static,
    {
        self.engine()?.register_timer(interval, true, Box::new(callback))
    }

    /// Queues `callback` to run at the start of the next main loop turn.
    ///
    /// While a bridge is running this also wakes a blocked main loop.
    pub fn call_soon<C>(&self, callback: C)
    where
        C: FnOnce() -> Result<(), Failure> + Send + 'static,
    {
        self.queued.push(Box::new(callback));
        self.fire_wake_hook();
    }

    /// Cooperative yield for code that resumed legacy-side work.
    ///
    /// Wakes a blocked main loop, if a bridge is running, then yields to
    /// the runtime.
    pub async fn pause(&self) {
        self.fire_wake_hook();
        tokio::task::yield_now().await;
    }

    /// Number of queued calls not yet run.
    #[must_use]
    pub fn queued_len(&self) -> usize {
        self.queued.len()
    }

    fn run_queued(&self) {
        // Only drain what is queued now; calls queued by these run next turn.
        for _ in 0..self.queued.len() {
            let Some(call) = self.queued.pop() else {
                break;
            };
            if let Err(failure) = call() {
                error!(%failure, "queued legacy call failed");
            }
        }
    }

    /// Runs the main loop until `done` settles, returning its outcome.
    ///
    /// Each turn arms a blocking [`ReactorEngine::iterate`] step, runs
    /// queued calls, checks `done`, then awaits the step. A wake landing
    /// after the check therefore ends the step instead of being lost.
    pub async fn run_until<T>(&self, done: &Deferred<T>) -> Result<T>
    where
        T: Clone + Send + 'static,
    {
        let engine = self.engine()?;
        loop {
            let step = engine.iterate(true);
            self.run_queued();
            if let Some(outcome) = done.result() {
                return outcome.map_err(Error::Legacy);
            }
            step.await;
        }
    }
}

impl Default for LegacyReactor {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for LegacyReactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LegacyReactor")
            .field("has_engine", &self.has_engine())
            .field("queued", &self.queued.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wake::WakeSignal;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Engine that only supports `iterate`, woken by a shared signal.
    struct SignalEngine {
        wake: WakeSignal,
        iterations: AtomicUsize,
    }

    impl ReactorEngine for SignalEngine {
        fn register_readable(&self, _: RawFd, _: LegacyCallback) -> Result<CancelHandle> {
            Err(Error::NotRunning)
        }

        fn register_writable(&self, _: RawFd, _: LegacyCallback) -> Result<CancelHandle> {
            Err(Error::NotRunning)
        }

        fn register_timer(&self, _: Duration, _: bool, _: LegacyCallback) -> Result<CancelHandle> {
            Err(Error::NotRunning)
        }

        fn iterate(&self, _block: bool) -> BoxFuture<'_, ()> {
            self.iterations.fetch_add(1, Ordering::SeqCst);
            Box::pin(self.wake.arm())
        }
    }

    #[test]
    fn registration_without_engine_is_a_usage_error() {
        let reactor = LegacyReactor::new();
        let err = reactor
            .call_later(Duration::from_millis(1), || Ok(()))
            .expect_err("no engine");
        assert!(err.is_usage());
    }

    #[test]
    fn install_returns_the_previous_engine() {
        let reactor = LegacyReactor::new();
        let engine: Arc<dyn ReactorEngine> = Arc::new(SignalEngine {
            wake: WakeSignal::new(),
            iterations: AtomicUsize::new(0),
        });
        assert!(reactor.install(engine.clone()).is_none());
        assert!(reactor.install(engine).is_some());
        assert!(reactor.uninstall().is_some());
        assert!(!reactor.has_engine());
    }

    #[tokio::test]
    async fn run_until_returns_settled_value_without_blocking() {
        let reactor = LegacyReactor::new();
        let engine = Arc::new(SignalEngine {
            wake: WakeSignal::new(),
            iterations: AtomicUsize::new(0),
        });
        reactor.install(engine.clone());

        let done = Deferred::succeeded(5u8);
        assert_eq!(reactor.run_until(&done).await.expect("value"), 5);
        // The step is armed but never awaited.
        assert_eq!(engine.iterations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn wake_between_check_and_block_is_not_lost() {
        let reactor = Arc::new(LegacyReactor::new());
        let wake = WakeSignal::new();
        reactor.install(Arc::new(SignalEngine {
            wake: wake.clone(),
            iterations: AtomicUsize::new(0),
        }));

        // The first queued call resolves `done` only after the loop has
        // checked it, the way a callback on another worker could.
        let (done, resolver) = Deferred::<()>::pending();
        let late = reactor.clone();
        let waker = wake.clone();
        reactor.call_soon(move || {
            late.call_soon(move || {
                resolver.resolve(());
                Ok(())
            });
            waker.notify();
            Ok(())
        });

        tokio::time::timeout(Duration::from_secs(1), reactor.run_until(&done))
            .await
            .expect("not stuck")
            .expect("resolved");
    }

    #[tokio::test]
    async fn wake_hook_fires_on_call_soon_and_pause() {
        let reactor = LegacyReactor::new();
        let wake = WakeSignal::new();
        assert!(reactor.set_wake_hook(Some(wake.clone())).is_none());

        let listener = wake.arm();
        reactor.call_soon(|| Ok(()));
        tokio::time::timeout(Duration::from_secs(1), listener)
            .await
            .expect("woken by call_soon");

        let listener = wake.arm();
        reactor.pause().await;
        tokio::time::timeout(Duration::from_secs(1), listener)
            .await
            .expect("woken by pause");

        assert!(reactor.set_wake_hook(None).is_some());
        let _listener = wake.arm();
        reactor.call_soon(|| Ok(()));
        assert!(wake.is_armed());
    }

    #[tokio::test]
    async fn queued_calls_run_and_failures_are_logged() {
        let reactor = Arc::new(LegacyReactor::new());
        let wake = WakeSignal::new();
        reactor.install(Arc::new(SignalEngine {
            wake: wake.clone(),
            iterations: AtomicUsize::new(0),
        }));

        let (done, resolver) = Deferred::<()>::pending();
        let ran = Arc::new(AtomicUsize::new(0));
        reactor.call_soon(|| Err(Failure::msg("ignored")));
        let count = ran.clone();
        reactor.call_soon(move || {
            count.fetch_add(1, Ordering::SeqCst);
            resolver.resolve(());
            Ok(())
        });

        reactor.run_until(&done).await.expect("resolved");
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(reactor.queued_len(), 0);
    }

    #[tokio::test]
    async fn failed_completion_is_reported() {
        let reactor = LegacyReactor::new();
        reactor.install(Arc::new(SignalEngine {
            wake: WakeSignal::new(),
            iterations: AtomicUsize::new(0),
        }));
        let done = Deferred::<()>::failed(Failure::msg("bad"));
        let err = reactor.run_until(&done).await.expect_err("failed");
        assert!(matches!(err, Error::Legacy(f) if f.to_string() == "bad"));
    }
}
