//! Tracing setup for the binary.

use tracing_subscriber::EnvFilter;

/// Filter for a `-v` count, unless `RUST_LOG` overrides it.
pub fn log_filter(verbosity: u8) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(verbosity_directives(verbosity)))
}

fn verbosity_directives(verbosity: u8) -> String {
    let (global, local) = match verbosity {
        0 => ("warn", "info"),
        1 => ("warn", "debug"),
        2 => ("info", "trace"),
        _ => ("debug", "trace"),
    };
    format!("{global},unchained_index={local},unchained={local}")
}

/// Logs go to stderr so command output on stdout stays machine readable.
pub fn init_tracing(verbosity: u8) {
    tracing_subscriber::fmt()
        .with_env_filter(log_filter(verbosity))
        .with_writer(std::io::stderr)
        .with_target(verbosity > 1)
        .init();
}
