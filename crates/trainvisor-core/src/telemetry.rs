//! Centralised tracing initialisation for the `trainvisor` binary.
//!
//! Call [`init_tracing`] once at program start to configure the global
//! subscriber with an `EnvFilter` and optional JSON formatting. Later calls
//! are ignored.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Initialise the global tracing subscriber.
///
/// * `json`: emit newline-delimited JSON log lines.
/// * `level`: default verbosity when `RUST_LOG` is not set.
///
/// Logs go to stderr so stdout stays free for command output.
pub fn init_tracing(json: bool, level: Level) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_writer(std::io::stderr).json())
            .try_init()
            .ok();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(false),
            )
            .try_init()
            .ok();
    }
}
