//! Diagnostic tracing for the harness.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: Dev diagnostics via `RUST_LOG`, output to stderr.
//!   Never part of the verdict.
//!
//! - **Console protocol (`recorder`)**: One `[PASS]`/`[FAIL]` line per executed
//!   phase plus the summary line, on stdout. Always printed, unaffected by `RUST_LOG`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`. Falls back to `warn`, or `yardcheck=debug` when `verbose`.
///
/// # Example
/// ```bash
/// RUST_LOG=yardcheck=trace yardcheck --host 10.0.0.5 --user ops
/// ```
pub fn init(verbose: bool) {
    let fallback = if verbose { "warn,yardcheck=debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
