//! Logging setup for live_index.
//!
//! Console output goes to stderr so that search results on stdout stay machine readable.
//! `RUST_LOG` takes precedence over the level chosen on the command line.

use tracing::Level;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global tracing subscriber.
///
/// Calling this more than once is harmless: later calls leave the first subscriber in place.
pub fn init_logging(log_level: Level) {
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(true)
        .with_file(false)
        .with_line_number(false);

    // Build an env-filter that respects RUST_LOG, falling back to the CLI level
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level.to_string()));

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init();
}
