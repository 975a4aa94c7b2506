//! Logging setup

use tracing::Level;

/// Install a formatted subscriber at `level`
///
/// Unknown levels fall back to `info`. Calling this more than once (or after
/// another subscriber was installed) is a no-op.
pub fn init_logging(level: &str) {
    let level = parse_level(level);
    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(true)
        .try_init();
}

fn parse_level(level: &str) -> Level {
    match level.to_ascii_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}
