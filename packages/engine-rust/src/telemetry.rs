//! Tracing subscriber setup for binaries.

use tracing_subscriber::EnvFilter;

/// Installs a `fmt` subscriber filtered by `RUST_LOG`, falling back to
/// `default_filter`. JSON output when `json` is set.
///
/// Calling it twice is a no-op: the second install fails silently.
pub fn init_tracing(default_filter: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let builder = tracing_subscriber::fmt().with_target(false).with_env_filter(filter);
    let _ = if json { builder.json().try_init() } else { builder.try_init() };
}
