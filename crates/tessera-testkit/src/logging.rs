//! Test log output.

use tracing_subscriber::EnvFilter;

/// Send tracing output to the test harness.
///
/// Honours `RUST_LOG`, defaulting to `info`. Safe to call from every test;
/// only the first call installs a subscriber.
pub fn init_test_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_test_writer()
        .try_init();
}
