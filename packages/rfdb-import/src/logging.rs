//! Log output setup for binaries and benches.
//!
//! The library itself only emits `tracing` events; installing a subscriber
//! is left to whoever owns the process.

use std::str::FromStr;

use tracing::Level;

/// Environment variable read by [`level_from_env`].
pub const LOG_LEVEL_ENV: &str = "RFDB_IMPORT_LOG";

/// Install a stderr fmt subscriber capped at `level`.
///
/// Returns false when a global subscriber was already installed (e.g. by
/// another test in the same process); that is not an error.
pub fn init_logging(level: Level) -> bool {
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_thread_names(true)
        .with_writer(std::io::stderr)
        .try_init()
        .is_ok()
}

/// Level named by `RFDB_IMPORT_LOG`, or `default` when unset or unparsable.
pub fn level_from_env(default: Level) -> Level {
    std::env::var(LOG_LEVEL_ENV)
        .ok()
        .and_then(|value| parse_level(&value))
        .unwrap_or(default)
}

fn parse_level(value: &str) -> Option<Level> {
    Level::from_str(value.trim()).ok()
}
