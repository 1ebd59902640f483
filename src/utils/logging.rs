//! Tracing setup for the broker binary.

use tracing_subscriber::EnvFilter;

/// Install the global fmt subscriber.
///
/// `RUST_LOG` wins when it is set and parses; otherwise everything at
/// `default_level` and above is logged. Calling this again is a no-op.
pub fn init(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(normalize(default_level)));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// Map a user supplied level name onto a directive `EnvFilter` accepts.
pub fn normalize(level: &str) -> &'static str {
    match level.to_lowercase().as_str() {
        "error" => "error",
        "warn" | "warning" => "warn",
        "debug" => "debug",
        "trace" => "trace",
        _ => "info",
    }
}

/// Level name for the `--verbose` switch.
pub fn level_for(verbose: bool) -> &'static str {
    if verbose { "debug" } else { "info" }
}
