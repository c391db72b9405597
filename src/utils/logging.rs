use tracing::Level;

/// Map a configured level name to a `tracing` level. Unknown names fall back
/// to `INFO`.
pub fn parse_level(name: &str) -> Level {
    match name.trim().to_ascii_lowercase().as_str() {
        "error" => Level::ERROR,
        "warn" | "warning" => Level::WARN,
        "debug" => Level::DEBUG,
        "trace" => Level::TRACE,
        _ => Level::INFO,
    }
}

/// Install the global fmt subscriber. Returns `false` if one was already
/// installed, which is expected in tests.
pub fn init(level: &str) -> bool {
    tracing_subscriber::fmt()
        .with_max_level(parse_level(level))
        .with_target(false)
        .try_init()
        .is_ok()
}
