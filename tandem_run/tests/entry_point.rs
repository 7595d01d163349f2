//! Runs as a plain binary so `#[tandem_run::main]` owns `fn main`.

use std::time::Duration;

use tandem_run::{await_legacy, BridgeManager, Deferred, LegacyReactor};

#[tandem_run::main]
async fn main() {
    let manager = BridgeManager::global();
    assert!(manager.is_running(), "bridge runs for the whole body");

    let (done, resolver) = Deferred::pending();
    LegacyReactor::global()
        .call_later(Duration::from_millis(5), move || {
            resolver.resolve("timer fired");
            Ok(())
        })
        .expect("engine installed");
    assert_eq!(await_legacy(&done).await.expect("resolved"), "timer fired");

    let structured = tandem_run::await_structured(async { Ok(7u8) }).expect("bridge running");
    assert_eq!(await_legacy(&structured).await.expect("value"), 7);

    tandem_run::checkpoint().await;

    let err = tandem_run::run(Deferred::succeeded(())).await.expect_err("nested run");
    assert!(err.is_usage());
}
