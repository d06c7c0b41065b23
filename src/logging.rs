//! Console logging for programs driving the engine.
//!
//! The engine itself only emits `tracing` events and spans. Each running task
//! gets a span carrying a progress indicator, which is drawn by the
//! `tracing-indicatif` layer installed here.

use tracing_indicatif::IndicatifLayer;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Installs the global subscriber.
///
/// Reads `RUST_LOG`, falling back to `warn`. Log lines go to stderr in the
/// compact format, printed above the progress bars.
///
/// ```bash
/// RUST_LOG=kiln=debug my-build
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let indicatif = IndicatifLayer::new();

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(indicatif.get_stderr_writer())
                .compact(),
        )
        .with(indicatif)
        .init();
}
