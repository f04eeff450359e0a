//! Helpers to wrangle logging across the fly-* crates.
//! NOTE: [initialize_tracing] should only ever be called in tests or binaries;
//! a library should only concern itself with instrumentation and logging.
use std::sync::Once;

static INITIALIZE_TRACING: Once = Once::new();

/// The filter used when `RUST_LOG` is not set
pub const DEFAULT_LOG_FILTER: &str = "fly_common,fly_tokens,fly_flaps=info";

/// Install a global `tracing-subscriber` that formats events to stderr,
/// filtered by `RUST_LOG` (or [DEFAULT_LOG_FILTER]). Subsequent calls are
/// no-ops.
pub fn initialize_tracing() {
    use tracing_subscriber::prelude::*;
    INITIALIZE_TRACING.call_once(|| {
        let _ = tracing_subscriber::registry()
            .with(tracing_subscriber::EnvFilter::new(
                std::env::var("RUST_LOG").unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
            ))
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init();
    });
}
