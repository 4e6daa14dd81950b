//! Structured logging setup for plugin processes.
//!
//! Everything goes to **stderr**: stdout belongs to the handshake line the
//! engine reads at startup, and a stray log line there would corrupt it.
//! Filtering follows `RUST_LOG` (e.g. `info`, `debug`,
//! `hemmer_plugin_core=debug`, or combinations like
//! `warn,hemmer_plugin_core=debug`).
//!
//! ```ignore
//! use hemmer_plugin_core::{serve, init_logging};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     init_logging();
//!     tracing::info!("Plugin starting");
//!     serve(MyProvider).await
//! }
//! ```

use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn subscriber(default_level: &str) -> impl SubscriberInitExt {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry().with(filter).with(
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false),
    )
}

/// Install the default subscriber: stderr output, `RUST_LOG` filtering,
/// `info` when `RUST_LOG` is unset.
///
/// # Panics
///
/// Panics if a global subscriber has already been set; use
/// [`try_init_logging`] when that is a possibility.
pub fn init_logging() {
    subscriber("info").init();
}

/// Like [`init_logging`], with a caller-chosen level (`"debug"`, `"warn"`,
/// ...) used when `RUST_LOG` is unset.
pub fn init_logging_with_default(default_level: &str) {
    subscriber(default_level).init();
}

/// Install the default subscriber unless one is already set. Returns
/// whether this call installed it. Useful in tests, where the process may
/// initialize more than once.
pub fn try_init_logging() -> bool {
    subscriber("info").try_init().is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    // The global subscriber can be set only once per process, so
    // installation itself is not unit-testable here; filter parsing is.
    #[test]
    fn test_env_filter_parsing() {
        assert!(EnvFilter::try_new("info").is_ok());
        assert!(EnvFilter::try_new("hemmer_plugin_core=debug").is_ok());
        assert!(EnvFilter::try_new("warn,hemmer_plugin_core=debug").is_ok());
    }
}
