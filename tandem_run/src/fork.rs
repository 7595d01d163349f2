//! Forking cancellable tasks into a scope.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::scope::{Scope, TaskCx};

type CancelAction = Box<dyn FnOnce() + Send + 'static>;

/// A deferred action that cancels one specific task.
///
/// Clones share the action; it runs at most once no matter how many clones
/// call [`CancelHandle::cancel`]. Calling it from inside the task it cancels
/// is allowed.
#[derive(Clone)]
pub struct CancelHandle {
    action: Arc<Mutex<Option<CancelAction>>>,
}

impl CancelHandle {
    /// Wraps an arbitrary cancellation action.
    pub fn new(action: impl FnOnce() + Send + 'static) -> Self {
        Self {
            action: Arc::new(Mutex::new(Some(Box::new(action)))),
        }
    }

    pub(crate) fn for_task(cx: TaskCx) -> Self {
        Self::new(move || cx.cancel())
    }

    /// Runs the action. Returns `false` if it already ran.
    pub fn cancel(&self) -> bool {
        let action = self.action.lock().take();
        match action {
            Some(action) => {
                action();
                true
            }
            None => false,
        }
    }

    /// Returns `true` once [`CancelHandle::cancel`] has been called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.action.lock().is_none()
    }
}

impl fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelHandle")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Starts `activity` as a task owned by `scope`.
///
/// The activity is handed its [`TaskCx`]. Once cancellation of the task (or
/// the scope) is observed outside any mask, the activity is dropped at its
/// next suspension point and the task ends quietly; an activity returning
/// [`Error::Cancelled`] also ends quietly. Any other error becomes a scope
/// fault.
///
/// The returned handle is usable immediately, before the task first runs.
///
/// # Arguments
///
/// * `scope` - The scope that owns the new task.
/// * `activity` - Builds the task's future from its [`TaskCx`].
///
/// # Panics
///
/// Panics if called outside a tokio runtime.
///
/// # Examples
///
/// ```ignore
/// let handle = fork(&scope, |cx| async move {
///     loop {
///         tokio::time::sleep(Duration::from_millis(5)).await;
///         cx.masked(|| tick());
///     }
/// });
/// handle.cancel();
/// ```
pub fn fork<F, Fut>(scope: &Scope, activity: F) -> CancelHandle
where
    F: FnOnce(TaskCx) -> Fut,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let cx = scope.task_cx();
    let handle = CancelHandle::for_task(cx.clone());
    let work = activity(cx.clone());
    scope.spawn(async move {
        tokio::select! {
            biased;
            () = cx.cancelled() => Err(Error::Cancelled),
            outcome = work => outcome,
        }
    });
    handle
}
