//! Reactor engine that services legacy registrations with scoped tokio tasks.
//!
//! Every registration becomes a task forked into the bridge's scope. The task
//! waits on the structured runtime (descriptor readiness or a timer), runs the
//! legacy callback with cancellation masked, then wakes the legacy main loop
//! through the shared [`WakeSignal`]. Ending the scope ends every registration.

use std::collections::HashMap;
use std::fmt;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::BoxFuture;
use metrics::{counter, gauge};
use parking_lot::Mutex;
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tracing::debug;

use crate::error::{Error, Result};
use crate::fork::{fork, CancelHandle};
use crate::legacy::{LegacyCallback, ReactorEngine};
use crate::scope::{Scope, TaskCx};
use crate::timer::Clock;
use crate::wake::WakeSignal;

/// A native descriptor owned by legacy code. Never closed by us.
#[derive(Debug)]
struct Descriptor(RawFd);

impl AsRawFd for Descriptor {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Direction {
    Read,
    Write,
}

impl Direction {
    const fn kind(self) -> &'static str {
        match self {
            Self::Read => "readable",
            Self::Write => "writable",
        }
    }

    const fn poll_events(self) -> libc::c_short {
        match self {
            Self::Read => libc::POLLIN,
            Self::Write => libc::POLLOUT,
        }
    }
}

/// Keeps the active-registration gauge in step with live registration tasks.
struct ActiveRegistration;

impl ActiveRegistration {
    fn new() -> Self {
        gauge!("tandem_run_registrations_active").increment(1.0);
        Self
    }
}

impl Drop for ActiveRegistration {
    fn drop(&mut self) {
        gauge!("tandem_run_registrations_active").decrement(1.0);
    }
}

/// The engine installed into the legacy reactor while a bridge runs.
pub struct BridgeEngine {
    scope: Scope,
    clock: Arc<dyn Clock>,
    wake: WakeSignal,
    // One registration with the runtime per descriptor, shared by its reader and writer.
    descriptors: Mutex<HashMap<RawFd, Weak<AsyncFd<Descriptor>>>>,
}

impl BridgeEngine {
    /// Creates an engine whose registrations are owned by `scope`.
    ///
    /// # Arguments
    ///
    /// * `scope` - Every registration task is forked into this scope.
    /// * `clock` - Drives timer registrations.
    /// * `wake` - Fired after each callback; [`ReactorEngine::iterate`] arms it.
    ///
    /// # Examples
    ///
    /// ```ignore
    /// let engine = BridgeEngine::new(scope, Arc::new(TokioClock), WakeSignal::new());
    /// reactor.install(Arc::new(engine));
    /// ```
    pub fn new(scope: Scope, clock: Arc<dyn Clock>, wake: WakeSignal) -> Self {
        Self {
            scope,
            clock,
            wake,
            descriptors: Mutex::new(HashMap::new()),
        }
    }

    /// The scope registrations are forked into.
    #[must_use]
    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// The signal that wakes [`ReactorEngine::iterate`].
    #[must_use]
    pub fn wake_signal(&self) -> &WakeSignal {
        &self.wake
    }

    fn descriptor(&self, fd: RawFd) -> Result<Arc<AsyncFd<Descriptor>>> {
        let mut descriptors = self.descriptors.lock();
        if let Some(existing) = descriptors.get(&fd).and_then(Weak::upgrade) {
            return Ok(existing);
        }
        descriptors.retain(|_, weak| weak.strong_count() > 0);
        let registered = Arc::new(AsyncFd::with_interest(
            Descriptor(fd),
            Interest::READABLE | Interest::WRITABLE,
        )?);
        descriptors.insert(fd, Arc::downgrade(&registered));
        Ok(registered)
    }

    fn watch(
        &self,
        fd: RawFd,
        direction: Direction,
        callback: LegacyCallback,
    ) -> Result<CancelHandle> {
        let descriptor = self.descriptor(fd)?;
        let wake = self.wake.clone();
        debug!(fd, kind = direction.kind(), scope = self.scope.id(), "descriptor registered");
        Ok(fork(&self.scope, move |cx| {
            watch_descriptor(cx, descriptor, direction, callback, wake)
        }))
    }
}

impl ReactorEngine for BridgeEngine {
    fn register_readable(&self, fd: RawFd, callback: LegacyCallback) -> Result<CancelHandle> {
        self.watch(fd, Direction::Read, callback)
    }

    fn register_writable(&self, fd: RawFd, callback: LegacyCallback) -> Result<CancelHandle> {
        self.watch(fd, Direction::Write, callback)
    }

    fn register_timer(
        &self,
        delay: Duration,
        repeat: bool,
        callback: LegacyCallback,
    ) -> Result<CancelHandle> {
        let clock = self.clock.clone();
        let wake = self.wake.clone();
        debug!(?delay, repeat, scope = self.scope.id(), "timer registered");
        Ok(fork(&self.scope, move |cx| {
            run_timer(cx, clock, delay, repeat, callback, wake)
        }))
    }

    fn iterate(&self, block: bool) -> BoxFuture<'_, ()> {
        if block {
            counter!("tandem_run_iterations_total", "mode" => "block").increment(1);
            Box::pin(self.wake.arm())
        } else {
            counter!("tandem_run_iterations_total", "mode" => "yield").increment(1);
            Box::pin(tokio::task::yield_now())
        }
    }
}

impl fmt::Debug for BridgeEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BridgeEngine")
            .field("scope", &self.scope)
            .field("descriptors", &self.descriptors.lock().len())
            .finish_non_exhaustive()
    }
}

async fn watch_descriptor(
    cx: TaskCx,
    descriptor: Arc<AsyncFd<Descriptor>>,
    direction: Direction,
    mut callback: LegacyCallback,
    wake: WakeSignal,
) -> Result<()> {
    let _active = ActiveRegistration::new();
    loop {
        if cx.is_cancel_requested() {
            return Err(Error::Cancelled);
        }
        let mut ready = match direction {
            Direction::Read => descriptor.readable().await?,
            Direction::Write => descriptor.writable().await?,
        };
        cx.masked(|| callback()).map_err(Error::CallbackFault)?;
        counter!("tandem_run_callbacks_total", "kind" => direction.kind()).increment(1);

        // The runtime reports edges; legacy callbacks expect levels.
        let again = still_ready(descriptor.as_raw_fd(), direction);
        if again {
            ready.retain_ready();
        } else {
            ready.clear_ready();
        }
        drop(ready);
        wake.notify();
        if again {
            tokio::task::yield_now().await;
        }
    }
}

async fn run_timer(
    cx: TaskCx,
    clock: Arc<dyn Clock>,
    delay: Duration,
    repeat: bool,
    mut callback: LegacyCallback,
    wake: WakeSignal,
) -> Result<()> {
    let _active = ActiveRegistration::new();
    loop {
        clock.sleep(delay).await;
        if cx.is_cancel_requested() {
            return Err(Error::Cancelled);
        }
        cx.masked(|| callback()).map_err(Error::CallbackFault)?;
        counter!("tandem_run_callbacks_total", "kind" => "timer").increment(1);
        wake.notify();
        if !repeat {
            return Ok(());
        }
    }
}

/// Probes `fd` without blocking.
fn still_ready(fd: RawFd, direction: Direction) -> bool {
    let events = direction.poll_events();
    let mut probe = libc::pollfd {
        fd,
        events,
        revents: 0,
    };
    // SAFETY: `probe` is a single valid pollfd that outlives the call, and a
    // zero timeout makes the call non-blocking.
    let ready = unsafe { libc::poll(&mut probe, 1, 0) };
    ready > 0 && probe.revents & (events | libc::POLLHUP | libc::POLLERR) != 0
}
