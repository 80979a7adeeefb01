//! Diagnostic logging.
//!
//! Progress the user asked for goes to stdout/stderr with `println!`; this
//! subscriber only carries diagnostics (command lines, poll attempts). Output
//! goes to stderr, filtered by `RUST_LOG` when set, otherwise by the
//! `--verbose` count.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter directive for a `-v` count.
pub fn default_directive(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "warn",
        1 => "info",
        _ => "debug",
    }
}

/// Install the global subscriber. Call once from `main`.
pub fn init(verbosity: u8) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbosity)));

    let result = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .try_init();
    if let Err(err) = result {
        eprintln!("  [WARN] logging already initialised: {}", err);
    }
}
