//! Tracing subscriber setup.
//!
//! Everything logs to stderr: a worker's stdout carries framed results, so
//! nothing else may ever be written there.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Default filter directive for the given CLI verbosity.
///
/// `-q` → errors only, none → info, `-v` → debug, `-vv` and up → trace.
pub fn default_directive(verbosity: u8, quiet: bool) -> &'static str {
    if quiet {
        return "livescribe=error";
    }
    match verbosity {
        0 => "livescribe=info",
        1 => "livescribe=debug",
        _ => "livescribe=trace",
    }
}

/// Install the global subscriber. `RUST_LOG` wins over the CLI flags.
///
/// Calling this twice is harmless; the second call is ignored.
pub fn init(verbosity: u8, quiet: bool) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbosity, quiet)));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);

    if tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .is_err()
    {
        tracing::debug!("tracing subscriber already installed");
    }
}
