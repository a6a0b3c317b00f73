//! Diagnostic tracing for the harness binaries.
//!
//! Tracing is for debugging only and goes to stderr. Run results live in the
//! ledger and are never affected by `RUST_LOG`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the global subscriber.
///
/// Reads `RUST_LOG`, defaulting to `warn`. Compact output on stderr.
///
/// ```bash
/// RUST_LOG=harness=debug eval run
/// ```
pub fn init() {
    init_with_default("warn");
}

/// Like [`init`], with a caller-chosen filter when `RUST_LOG` is unset.
pub fn init_with_default(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    // A second init (tests, embedding) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
}
