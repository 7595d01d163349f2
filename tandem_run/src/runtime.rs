//! Bridge lifecycle.
//!
//! A [`BridgeManager`] owns the active-scope registry for one
//! [`LegacyReactor`]. Starting a bridge opens a scope, installs a
//! [`BridgeEngine`] bound to it as the reactor's engine and registers the
//! scope; stopping the bridge cancels the scope, which ends every legacy
//! registration, then puts the previous engine back and clears the registry.
//!
//! Only one bridge may be registered with a manager at a time. The
//! process-wide entry points at the bottom of this module all go through
//! [`BridgeManager::global`].

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use futures::FutureExt;
use metrics::counter;
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::config::BridgeConfig;
use crate::error::{Error, Failure, Result};
use crate::legacy::{Deferred, LegacyReactor, ReactorEngine};
use crate::reactor::BridgeEngine;
use crate::scope::{CancelReason, Scope};
use crate::timer::{Clock, TokioClock};
use crate::wake::WakeSignal;

/// Lifecycle of a bridge.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunState {
    /// No bridge has run on this manager yet.
    Idle,
    /// Registered and driving the legacy main loop.
    Running,
    /// Torn down. Terminal.
    Stopped,
}

/// The registry entry for the running bridge.
#[derive(Clone)]
pub(crate) struct Session {
    pub(crate) scope: Scope,
    pub(crate) wake: WakeSignal,
}

/// Runs legacy reactor code on top of scoped tokio tasks.
pub struct BridgeManager {
    reactor: Arc<LegacyReactor>,
    clock: Arc<dyn Clock>,
    config: BridgeConfig,
    active: Mutex<Option<Session>>,
    stopped_once: AtomicBool,
}

impl BridgeManager {
    /// Creates a manager for `reactor` with the default configuration and the
    /// tokio clock.
    pub fn new(reactor: Arc<LegacyReactor>) -> Self {
        Self {
            reactor,
            clock: Arc::new(TokioClock),
            config: BridgeConfig::default(),
            active: Mutex::new(None),
            stopped_once: AtomicBool::new(false),
        }
    }

    /// Creates a manager with `config`, starting its metrics exporter if one
    /// is configured.
    pub fn with_config(reactor: Arc<LegacyReactor>, config: BridgeConfig) -> Result<Self> {
        config.install_metrics()?;
        Ok(Self {
            config,
            ..Self::new(reactor)
        })
    }

    /// Replaces the clock used for timer registrations.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// The manager behind the process-wide entry points.
    ///
    /// Configured from the environment on first use; an invalid environment
    /// is logged and the defaults are used.
    pub fn global() -> &'static BridgeManager {
        static GLOBAL: OnceLock<BridgeManager> = OnceLock::new();
        GLOBAL.get_or_init(|| {
            let reactor = LegacyReactor::global().clone();
            let config = BridgeConfig::from_env().unwrap_or_else(|err| {
                warn!(%err, "ignoring bridge environment");
                BridgeConfig::default()
            });
            Self::with_config(reactor.clone(), config).unwrap_or_else(|err| {
                warn!(%err, "bridge metrics disabled");
                Self::new(reactor)
            })
        })
    }

    /// The reactor this manager installs its engine into.
    #[must_use]
    pub fn reactor(&self) -> &Arc<LegacyReactor> {
        &self.reactor
    }

    /// The configuration in use.
    #[must_use]
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Where this manager is in the `Idle -> Running -> Stopped` lifecycle.
    ///
    /// After a run ends the manager reports [`RunState::Stopped`] until the
    /// next [`BridgeManager::start`].
    #[must_use]
    pub fn state(&self) -> RunState {
        if self.is_running() {
            RunState::Running
        } else if self.stopped_once.load(Ordering::Acquire) {
            RunState::Stopped
        } else {
            RunState::Idle
        }
    }

    /// Returns `true` while a bridge is registered.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.active.lock().is_some()
    }

    /// The scope of the running bridge.
    #[must_use]
    pub fn active_scope(&self) -> Option<Scope> {
        self.active.lock().as_ref().map(|session| session.scope.clone())
    }

    pub(crate) fn session(&self) -> Result<Session> {
        self.active.lock().clone().ok_or(Error::NotRunning)
    }

    /// Wakes the running bridge's blocking step. Does nothing if no bridge
    /// is running or the loop is not blocked.
    pub fn notify(&self) {
        let wake = self.active.lock().as_ref().map(|session| session.wake.clone());
        if let Some(wake) = wake {
            wake.notify();
        }
    }

    /// Cooperative yield for structured code that touches legacy state.
    ///
    /// Same as [`LegacyReactor::pause`] on this manager's reactor.
    pub async fn checkpoint(&self) {
        self.reactor.pause().await;
    }

    /// Registers a new bridge and installs its engine.
    ///
    /// The new bridge's wake signal becomes the reactor's wake hook, so
    /// [`LegacyReactor::call_soon`] and [`LegacyReactor::pause`] wake the
    /// blocked main loop for as long as the bridge runs.
    ///
    /// # Returns
    ///
    /// A [`RunningBridge`] in [`RunState::Running`]. Drive it with
    /// [`RunningBridge::drive`]; dropping it tears the bridge down.
    ///
    /// # Errors
    ///
    /// [`Error::AlreadyRunning`] if a bridge is registered. The registered
    /// bridge is left as it was.
    ///
    /// # Examples
    ///
    /// ```ignore
    /// let running = manager.start()?;
    /// manager.reactor().call_later(Duration::from_millis(10), move || {
    ///     resolver.resolve(());
    ///     Ok(())
    /// })?;
    /// running.drive(done).await?;
    /// ```
    pub fn start(&self) -> Result<RunningBridge<'_>> {
        let session = {
            let mut active = self.active.lock();
            if let Some(current) = active.as_ref() {
                warn!(scope = current.scope.id(), "bridge already running");
                return Err(Error::AlreadyRunning);
            }
            let session = Session {
                scope: Scope::new(self.config.scope_name.clone()),
                wake: WakeSignal::new(),
            };
            *active = Some(session.clone());
            session
        };

        let engine = BridgeEngine::new(session.scope.clone(), self.clock.clone(), session.wake.clone());
        let previous = self.reactor.install(Arc::new(engine));
        let previous_hook = self.reactor.set_wake_hook(Some(session.wake.clone()));
        counter!("tandem_run_bridge_runs_total").increment(1);
        info!(scope = session.scope.id(), name = session.scope.name(), "bridge started");

        Ok(RunningBridge {
            manager: self,
            session,
            previous: Some((previous, previous_hook)),
            state: RunState::Running,
        })
    }

    /// Runs the bridge until `done` settles and returns its value.
    ///
    /// # Arguments
    ///
    /// * `done` - The completion value. Legacy code settles it to end the run.
    ///
    /// # Errors
    ///
    /// [`Error::AlreadyRunning`] if a bridge is registered, the scope's fault
    /// if a registration failed first, or [`Error::Legacy`] if `done` fails.
    pub async fn run<T>(&self, done: Deferred<T>) -> Result<T>
    where
        T: Clone + Send + 'static,
    {
        self.start()?.drive(done).await
    }

    /// Runs the bridge for as long as `body` runs.
    ///
    /// When `body` finishes, by returning or by panicking, the bridge is
    /// told to stop and then torn down before this returns. If the bridge's
    /// scope is cancelled first, for example by a failing legacy callback,
    /// `body` is dropped at its next suspension point and the scope's fault
    /// is returned.
    ///
    /// # Arguments
    ///
    /// * `body` - Produces the structured work to run alongside the bridge.
    ///
    /// # Errors
    ///
    /// [`Error::AlreadyRunning`] if a bridge is registered, or the scope's
    /// fault if it ended the run before `body` finished.
    ///
    /// # Panics
    ///
    /// A panic in `body` is resumed once the bridge is torn down.
    ///
    /// # Examples
    ///
    /// ```ignore
    /// let answer = manager
    ///     .run_in_background(|| async {
    ///         let deferred = legacy_lookup();
    ///         tandem_run::await_legacy(&deferred).await
    ///     })
    ///     .await?;
    /// ```
    pub async fn run_in_background<F, Fut>(&self, body: F) -> Result<Fut::Output>
    where
        F: FnOnce() -> Fut,
        Fut: Future,
    {
        let running = self.start()?;
        let scope = running.scope().clone();
        let (stop, stop_resolver) = Deferred::<()>::pending();
        let work = async {
            let body = AssertUnwindSafe(async move { body().await }).catch_unwind();
            let outcome = tokio::select! {
                biased;
                () = scope.cancelled() => None,
                outcome = body => Some(outcome),
            };
            stop_resolver.resolve(());
            self.notify();
            outcome
        };

        let (stopped, outcome) = futures::future::join(running.drive(stop), work).await;
        match outcome {
            Some(Ok(output)) => stopped.map(|()| output),
            Some(Err(panic)) => std::panic::resume_unwind(panic),
            // The scope ended the run, so `drive` returned its fault.
            None => Err(stopped.err().unwrap_or(Error::Cancelled)),
        }
    }
}

impl fmt::Debug for BridgeManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BridgeManager")
            .field("reactor", &self.reactor)
            .field("config", &self.config)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

/// A registered bridge. Dropping it tears the bridge down.
#[must_use = "the bridge is torn down when this is dropped"]
pub struct RunningBridge<'a> {
    manager: &'a BridgeManager,
    session: Session,
    previous: Option<(Option<Arc<dyn ReactorEngine>>, Option<WakeSignal>)>,
    state: RunState,
}

impl RunningBridge<'_> {
    /// The bridge's scope.
    #[must_use]
    pub fn scope(&self) -> &Scope {
        &self.session.scope
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> RunState {
        self.state
    }

    /// Drives the legacy main loop until `done` settles, then stops.
    ///
    /// A fault in the bridge's scope ends the loop early and is returned.
    pub async fn drive<T>(mut self, done: Deferred<T>) -> Result<T>
    where
        T: Clone + Send + 'static,
    {
        let scope = self.session.scope.clone();
        let outcome = tokio::select! {
            biased;
            () = scope.cancelled() => Err(scope.take_fault().unwrap_or(Error::Cancelled)),
            outcome = self.manager.reactor.run_until(&done) => outcome,
        };

        let closed = scope.close(CancelReason::Stopped).await;
        self.state = RunState::Stopped;
        match (outcome, closed) {
            (Ok(value), Ok(())) => Ok(value),
            (Err(error), _) | (Ok(_), Err(error)) => Err(error),
        }
    }
}

impl Drop for RunningBridge<'_> {
    fn drop(&mut self) {
        let scope = &self.session.scope;
        if self.state == RunState::Running {
            warn!(scope = scope.id(), "bridge dropped while running");
        }
        scope.abort(CancelReason::Stopped);
        if let Some((engine, hook)) = self.previous.take() {
            self.manager.reactor.restore(engine);
            self.manager.reactor.set_wake_hook(hook);
        }
        {
            let mut active = self.manager.active.lock();
            if active.as_ref().is_some_and(|session| session.scope.id() == scope.id()) {
                *active = None;
            }
        }
        self.manager.stopped_once.store(true, Ordering::Release);
        self.state = RunState::Stopped;
        info!(scope = scope.id(), "bridge stopped");
    }
}

impl fmt::Debug for RunningBridge<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunningBridge")
            .field("scope", &self.session.scope)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

/// Runs the process-wide bridge until `done` settles.
///
/// # Errors
///
/// [`Error::AlreadyRunning`] if the process-wide bridge is running, a scope
/// fault, or [`Error::Legacy`] if `done` fails.
pub async fn run<T>(done: Deferred<T>) -> Result<T>
where
    T: Clone + Send + 'static,
{
    BridgeManager::global().run(done).await
}

/// Runs the process-wide bridge for the duration of `body`.
pub async fn run_in_background<F, Fut>(body: F) -> Result<Fut::Output>
where
    F: FnOnce() -> Fut,
    Fut: Future,
{
    BridgeManager::global().run_in_background(body).await
}

/// Bridges a structured future into the process-wide bridge's legacy world.
pub fn await_structured<T, Fut>(source: Fut) -> Result<Deferred<T>>
where
    T: Clone + Send + 'static,
    Fut: Future<Output = std::result::Result<T, Failure>> + Send + 'static,
{
    BridgeManager::global().await_structured(source)
}

/// Bridge-aware cooperative yield on the process-wide bridge.
pub async fn checkpoint() {
    BridgeManager::global().checkpoint().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn manager() -> BridgeManager {
        BridgeManager::new(Arc::new(LegacyReactor::new()))
    }

    #[tokio::test]
    async fn state_moves_from_idle_to_running_to_stopped() {
        let manager = manager();
        assert_eq!(manager.state(), RunState::Idle);

        let running = manager.start().expect("start");
        assert_eq!(manager.state(), RunState::Running);
        assert_eq!(running.state(), RunState::Running);

        running.drive(Deferred::succeeded(())).await.expect("stopped");
        assert_eq!(manager.state(), RunState::Stopped);
    }

    #[tokio::test]
    async fn start_installs_and_drop_clears_the_wake_hook() {
        let manager = manager();
        let running = manager.start().expect("start");
        assert!(manager.reactor().set_wake_hook(None).is_some());
        manager.reactor().set_wake_hook(Some(running.session.wake.clone()));

        drop(running);
        assert!(manager.reactor().set_wake_hook(None).is_none());
    }

    #[tokio::test]
    async fn second_start_fails_and_keeps_the_first() {
        let manager = manager();
        let first = manager.start().expect("first");
        let scope_id = first.scope().id();

        let err = manager.start().expect_err("second");
        assert!(matches!(err, Error::AlreadyRunning));
        assert_eq!(manager.active_scope().map(|scope| scope.id()), Some(scope_id));
        assert!(manager.reactor().has_engine());

        drop(first);
        assert!(!manager.is_running());
        assert!(!manager.reactor().has_engine());
    }

    #[tokio::test(start_paused = true)]
    async fn run_returns_the_completion_value_and_clears_state() {
        let manager = manager();
        let (done, resolver) = Deferred::pending();
        let reactor = manager.reactor().clone();
        let value = async {
            tokio::task::yield_now().await;
            reactor
                .call_later(Duration::from_millis(20), move || {
                    resolver.resolve("finished");
                    Ok(())
                })
                .expect("timer");
        };
        let (outcome, ()) = futures::future::join(manager.run(done), value).await;
        assert_eq!(outcome.expect("run"), "finished");
        assert!(!manager.is_running());
        assert!(!manager.reactor().has_engine());
    }

    #[tokio::test]
    async fn checkpoint_wakes_the_loop_for_queued_work() {
        let manager = manager();
        let running = manager.start().expect("start");
        let (done, resolver) = Deferred::pending();

        let drive = running.drive(done);
        let nudge = async {
            tokio::task::yield_now().await;
            manager.reactor().call_soon(move || {
                resolver.resolve(3u8);
                Ok(())
            });
            manager.checkpoint().await;
        };
        let (outcome, ()) = futures::future::join(drive, nudge).await;
        assert_eq!(outcome.expect("run"), 3);
    }

    #[tokio::test]
    async fn dropping_the_run_future_tears_down() {
        let manager = manager();
        let (done, _resolver) = Deferred::<()>::pending();
        {
            let run = manager.run(done);
            let _ = tokio::time::timeout(Duration::from_millis(5), run).await;
        }
        assert!(!manager.is_running());
        assert!(!manager.reactor().has_engine());
    }

    #[tokio::test]
    async fn previous_engine_is_restored() {
        let reactor = Arc::new(LegacyReactor::new());
        let outer = BridgeManager::new(reactor.clone());
        let inner = BridgeManager::new(reactor.clone());

        let first = outer.start().expect("outer");
        let second = inner.start().expect("inner");
        drop(second);
        assert!(reactor.has_engine());
        drop(first);
        assert!(!reactor.has_engine());
    }
}
