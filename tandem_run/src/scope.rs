//! Structured task scopes.
//!
//! A [`Scope`] owns every task spawned into it. Closing the scope requests
//! cancellation, then joins each task; dropping an unclosed scope aborts
//! whatever is left. A task that fails with anything other than
//! [`Error::Cancelled`] records a fault on the scope and cancels its
//! siblings.
//!
//! Each task gets a [`TaskCx`] carrying its own cancellation flag and the
//! scope's. A task can mask cancellation around critical sections; a cancel
//! requested under a mask is observed only once the last mask is released.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, warn};

use crate::error::{Error, Result};

static NEXT_SCOPE_ID: AtomicU64 = AtomicU64::new(1);

/// Why a scope was cancelled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CancelReason {
    /// Cancelled explicitly.
    Requested,
    /// The bridge finished and is unwinding its scope.
    Stopped,
    /// A task in the scope failed.
    Fault,
}

/// A cancellation flag that tasks can wait on.
#[derive(Debug, Default)]
pub(crate) struct CancelState {
    requested: AtomicBool,
    notify: Notify,
}

impl CancelState {
    pub(crate) fn cancel(&self) -> bool {
        let first = !self.requested.swap(true, Ordering::AcqRel);
        if first {
            self.notify.notify_waiters();
        }
        first
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    pub(crate) async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a cancel between the two is not lost.
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

struct ScopeInner {
    id: u64,
    name: String,
    cancel: Arc<CancelState>,
    reason: Mutex<Option<CancelReason>>,
    fault: Mutex<Option<Error>>,
    tasks: Mutex<JoinSet<()>>,
}

impl ScopeInner {
    fn cancel(&self, reason: CancelReason) {
        {
            let mut slot = self.reason.lock();
            if slot.is_some() {
                return;
            }
            *slot = Some(reason);
        }
        self.cancel.cancel();
        debug!(scope = self.id, name = %self.name, ?reason, "scope cancelled");
    }

    fn record_fault(&self, error: Error) {
        {
            let mut fault = self.fault.lock();
            if fault.is_some() {
                debug!(scope = self.id, %error, "additional scope fault dropped");
                return;
            }
            warn!(scope = self.id, name = %self.name, %error, "scope faulted");
            *fault = Some(error);
        }
        self.cancel(CancelReason::Fault);
    }

    fn record_join(&self, joined: std::result::Result<(), JoinError>) {
        if let Err(err) = joined {
            if err.is_panic() {
                self.record_fault(Error::TaskPanicked(panic_message(err.into_panic())));
            }
        }
    }
}

/// Ownership boundary for a group of tasks.
///
/// Cheap to clone; clones refer to the same scope.
#[derive(Clone)]
pub struct Scope {
    inner: Arc<ScopeInner>,
}

impl Scope {
    /// Opens a new, empty scope.
    ///
    /// Spawning into the scope requires a tokio runtime context.
    pub fn new(name: impl Into<String>) -> Self {
        let inner = ScopeInner {
            id: NEXT_SCOPE_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            cancel: Arc::new(CancelState::default()),
            reason: Mutex::new(None),
            fault: Mutex::new(None),
            tasks: Mutex::new(JoinSet::new()),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Unique id of this scope within the process.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Name given at creation, used in logs.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Requests cancellation of every task in the scope.
    pub fn cancel(&self, reason: CancelReason) {
        self.inner.cancel(reason);
    }

    /// Returns `true` once cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// The reason passed to the first [`Scope::cancel`], if any.
    #[must_use]
    pub fn cancel_reason(&self) -> Option<CancelReason> {
        *self.inner.reason.lock()
    }

    /// Completes when the scope is cancelled, for any reason.
    pub async fn cancelled(&self) {
        self.inner.cancel.wait().await;
    }

    /// Removes and returns the recorded fault, if any.
    pub fn take_fault(&self) -> Option<Error> {
        self.inner.fault.lock().take()
    }

    /// Returns `true` if a task in this scope failed.
    #[must_use]
    pub fn has_fault(&self) -> bool {
        self.inner.fault.lock().is_some()
    }

    /// Number of tasks spawned and not yet reaped.
    #[must_use]
    pub fn task_count(&self) -> usize {
        self.inner.tasks.lock().len()
    }

    /// Creates the cancellation context for a new task in this scope.
    pub(crate) fn task_cx(&self) -> TaskCx {
        TaskCx {
            inner: Arc::new(TaskCxInner {
                scope: self.inner.cancel.clone(),
                own: CancelState::default(),
                mask_depth: AtomicU32::new(0),
                unmasked: Notify::new(),
            }),
        }
    }

    /// Spawns `task` into the scope.
    ///
    /// An `Err` other than [`Error::Cancelled`] is recorded as the scope's
    /// fault. Spawning into a cancelled scope still spawns; the task is
    /// expected to observe cancellation through its [`TaskCx`].
    pub(crate) fn spawn<F>(&self, task: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        // Tasks hold the scope weakly; the scope owns them, not the other way round.
        let owner = Arc::downgrade(&self.inner);
        let mut tasks = self.inner.tasks.lock();
        // Reap finished tasks so long-lived scopes don't accumulate them.
        while let Some(joined) = tasks.try_join_next() {
            self.inner.record_join(joined);
        }
        tasks.spawn(async move {
            let error = match AssertUnwindSafe(task).catch_unwind().await {
                Ok(Ok(()) | Err(Error::Cancelled)) => return,
                Ok(Err(error)) => error,
                Err(payload) => Error::TaskPanicked(panic_message(payload)),
            };
            if let Some(inner) = Weak::upgrade(&owner) {
                inner.record_fault(error);
            }
        });
    }

    /// Cancels the scope and waits for every task in it to finish.
    ///
    /// Returns the scope's fault, if one was recorded.
    pub async fn close(&self, reason: CancelReason) -> Result<()> {
        self.cancel(reason);
        let mut tasks = std::mem::take(&mut *self.inner.tasks.lock());
        while let Some(joined) = tasks.join_next().await {
            self.inner.record_join(joined);
        }
        debug!(scope = self.inner.id, name = %self.inner.name, "scope closed");
        match self.take_fault() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Cancels the scope and aborts its tasks without waiting for them.
    pub(crate) fn abort(&self, reason: CancelReason) {
        self.cancel(reason);
        self.inner.tasks.lock().abort_all();
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}

struct TaskCxInner {
    scope: Arc<CancelState>,
    own: CancelState,
    mask_depth: AtomicU32,
    unmasked: Notify,
}

/// Cancellation context handed to a forked task.
#[derive(Clone)]
pub struct TaskCx {
    inner: Arc<TaskCxInner>,
}

impl TaskCx {
    /// Requests cancellation of this task only.
    pub fn cancel(&self) {
        self.inner.own.cancel();
    }

    /// Returns `true` if this task or its scope was cancelled.
    #[must_use]
    pub fn is_cancel_requested(&self) -> bool {
        self.inner.own.is_cancelled() || self.inner.scope.is_cancelled()
    }

    /// Returns `true` while at least one mask is held.
    #[must_use]
    pub fn is_masked(&self) -> bool {
        self.inner.mask_depth.load(Ordering::Acquire) > 0
    }

    /// Masks cancellation until the returned guard is dropped.
    ///
    /// Masks nest.
    pub fn mask(&self) -> MaskGuard {
        self.inner.mask_depth.fetch_add(1, Ordering::AcqRel);
        MaskGuard {
            inner: self.inner.clone(),
        }
    }

    /// Runs `f` with cancellation masked.
    pub fn masked<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = self.mask();
        f()
    }

    /// Completes once cancellation was requested and no mask is held.
    pub async fn cancelled(&self) {
        tokio::select! {
            () = self.inner.own.wait() => {}
            () = self.inner.scope.wait() => {}
        }
        loop {
            let unmasked = self.inner.unmasked.notified();
            tokio::pin!(unmasked);
            unmasked.as_mut().enable();
            if !self.is_masked() {
                return;
            }
            unmasked.await;
        }
    }
}

impl fmt::Debug for TaskCx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskCx")
            .field("cancel_requested", &self.is_cancel_requested())
            .field("masked", &self.is_masked())
            .finish()
    }
}

/// Releases one level of cancellation mask on drop.
#[must_use = "the mask is released as soon as the guard is dropped"]
pub struct MaskGuard {
    inner: Arc<TaskCxInner>,
}

impl Drop for MaskGuard {
    fn drop(&mut self) {
        if self.inner.mask_depth.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.inner.unmasked.notify_waiters();
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
