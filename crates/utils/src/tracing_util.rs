//! Helpers related to tracing, used by main entrypoints

use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// The environment variable holding the log filter; like `RUST_LOG`
/// but scoped to this tool so that enclosing build systems which set
/// `RUST_LOG` for their own purposes don't turn on our tracing.
const LOG_ENV: &str = "IMG_LOG";

/// Initialize the tracing subscriber; output goes to stderr so that
/// stdout stays reserved for command output (some subcommands stream
/// tar data there).
pub fn initialize_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .without_time();
    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(filter)
        .init();
}
