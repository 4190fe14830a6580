//! Shared fixtures and a reference interpreter for the integration tests.

pub mod fixtures;
pub mod interp;

/// Installs a test subscriber once; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}
