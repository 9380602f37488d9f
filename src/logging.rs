//! Tracing subscriber setup for binaries and tools.
//!
//! `RUST_LOG` overrides the configured level when it is set.

use tracing_subscriber::EnvFilter;

/// Install a `fmt` subscriber filtered at `level` (trace, debug, info, warn, error).
///
/// Returns `false` if a global subscriber was already installed.
pub fn init(level: &str) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("rust_tsp={level},warn")));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .is_ok()
}
