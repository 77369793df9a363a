//! Tracing subscriber setup for a node process.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter used when neither `RUST_LOG` nor the config names one.
pub const DEFAULT_FILTER: &str = "info";

/// Installs the global subscriber: console output filtered by `RUST_LOG`,
/// falling back to `level` (for example `"info,arclink_session=debug"`).
///
/// Safe to call more than once; later calls leave the first subscriber in
/// place.
pub fn init_tracing(level: &str) {
    let level = if level.is_empty() { DEFAULT_FILTER } else { level };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let console_layer = fmt::layer()
        .with_target(true)
        .with_thread_names(true)
        .with_timer(fmt::time::uptime());

    let installed = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .try_init();
    if installed.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}
