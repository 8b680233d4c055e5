//! Tracing subscriber setup

use tracing_subscriber::EnvFilter;

/// Build the filter: an explicit directive wins, then `RUST_LOG`, then
/// `fallback`, then `info`.
pub fn build_filter(explicit: Option<&str>, fallback: &str) -> EnvFilter {
    explicit
        .ok_or(())
        .and_then(|level| EnvFilter::try_new(level).map_err(|_| ()))
        .or_else(|_| EnvFilter::try_from_default_env().map_err(|_| ()))
        .or_else(|_| EnvFilter::try_new(fallback).map_err(|_| ()))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install a `fmt` subscriber writing to stderr so report output on stdout
/// stays machine-readable
pub fn init_tracing(explicit: Option<&str>, fallback: &str) {
    let filter = build_filter(explicit, fallback);

    // try_init: a subscriber may already be installed (tests, embedding)
    if tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .is_err()
    {
        tracing::debug!("Global tracing subscriber already initialized, skipping");
    }
}
