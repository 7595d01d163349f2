//! Single-slot wake signal used to interrupt the legacy reactor's blocking step.
//!
//! The slot holds at most one pending one-shot notification. The blocking
//! step installs a fresh one with [`WakeSignal::arm`] and waits on the
//! returned [`WakeListener`]; any task may call [`WakeSignal::notify`] to
//! force whatever is installed. A notify with nothing installed is dropped.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::channel::oneshot;
use metrics::counter;
use parking_lot::Mutex;

/// Wakes the legacy reactor's blocking step.
///
/// Clones share the same slot.
#[derive(Clone, Debug, Default)]
pub struct WakeSignal {
    slot: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}

impl WakeSignal {
    /// Creates an empty wake signal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Forces the installed notification, if any.
    ///
    /// Never fails and may be called from any task at any time.
    pub fn notify(&self) {
        let pending = self.slot.lock().take();
        if let Some(sender) = pending {
            // The listener may already be gone; that is fine.
            let _ = sender.send(());
            counter!("tandem_run_wake_notify_total").increment(1);
        }
    }

    /// Installs a fresh notification and returns a future that completes
    /// when it is forced.
    ///
    /// Any notification that was installed and not yet forced is discarded.
    pub fn arm(&self) -> WakeListener {
        let (sender, receiver) = oneshot::channel();
        let superseded = self.slot.lock().replace(sender);
        drop(superseded);
        WakeListener { receiver }
    }

    /// Returns `true` while a notification is installed and unforced.
    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.slot.lock().is_some()
    }
}

/// Completes when the notification it was armed with is forced.
///
/// Also completes if the notification is superseded by a later
/// [`WakeSignal::arm`], since the sender is dropped.
#[derive(Debug)]
#[must_use = "a listener does nothing unless awaited"]
pub struct WakeListener {
    receiver: oneshot::Receiver<()>,
}

impl Future for WakeListener {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        Pin::new(&mut self.receiver).poll(cx).map(|_| ())
    }
}
