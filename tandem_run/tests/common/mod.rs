#![allow(dead_code)]

use std::sync::{Arc, Once};

use tandem_run::{BridgeManager, LegacyReactor};
use tracing_subscriber::EnvFilter;

pub fn init_test_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// A manager over its own reactor, so tests don't share the global one.
pub fn manager() -> BridgeManager {
    init_test_logging();
    BridgeManager::new(Arc::new(LegacyReactor::new()))
}
