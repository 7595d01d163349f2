//! Runs callback-driven reactor code on top of structured tokio tasks.
//!
//! Legacy code keeps registering descriptor and timer callbacks with a
//! [`LegacyReactor`] and keeps calling its blocking main loop. While a bridge
//! runs, every registration is serviced by a task owned by the bridge's
//! [`Scope`], and the main loop's blocking step sleeps on a single-slot
//! [`WakeSignal`] that each serviced event fires. Values move between the two
//! worlds with [`await_legacy`] and [`await_structured`].
//!
//! - [`runtime`]: bridge lifecycle ([`BridgeManager`])
//! - [`reactor`]: the engine that services legacy registrations
//! - [`bridge`]: awaiting values across the two worlds
//! - [`scope`] and [`fork`]: scoped tasks and per-task cancellation
//! - [`wake`]: the wake signal
//! - [`legacy`]: the reactor interface legacy code is written against
//! - [`config`], [`error`], [`timer`]: settings, errors, clocks
//!
//! ```no_run
//! use std::time::Duration;
//! use tandem_run::{Deferred, LegacyReactor};
//!
//! #[tandem_run::main]
//! async fn main() {
//!     let (done, resolver) = Deferred::pending();
//!     LegacyReactor::global()
//!         .call_later(Duration::from_millis(10), move || {
//!             resolver.resolve(());
//!             Ok(())
//!         })
//!         .expect("bridge running");
//!     tandem_run::await_legacy(&done).await.expect("resolved");
//! }
//! ```

pub mod bridge;
pub mod config;
pub mod error;
pub mod fork;
pub mod legacy;
pub mod reactor;
pub mod runtime;
pub mod scope;
pub mod timer;
pub mod wake;

pub use bridge::await_legacy;
pub use config::BridgeConfig;
pub use error::{Error, Failure, Result};
pub use fork::{fork, CancelHandle};
pub use legacy::{Deferred, LegacyReactor, ReactorEngine, Resolver};
pub use reactor::BridgeEngine;
pub use runtime::{
    await_structured, checkpoint, run, run_in_background, BridgeManager, RunState, RunningBridge,
};
pub use scope::{CancelReason, Scope, TaskCx};
pub use wake::WakeSignal;

pub use tandem_run_macros::main;

#[doc(hidden)]
pub mod __private {
    pub use tokio;
}
