use std::sync::Once;

use log::LevelFilter;

static RUST_LOG_ONCE: Once = Once::new();

fn env_level() -> LevelFilter {
    std::env::var("POWERSHIELD_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .ok()
        .as_deref()
        .and_then(parse_level)
        .unwrap_or(LevelFilter::Info)
}

fn level_to_str(level: LevelFilter) -> &'static str {
    match level {
        LevelFilter::Off => "off",
        LevelFilter::Error => "error",
        LevelFilter::Warn => "warn",
        LevelFilter::Info => "info",
        LevelFilter::Debug => "debug",
        LevelFilter::Trace => "trace",
    }
}

fn parse_level(input: &str) -> Option<LevelFilter> {
    input.trim().parse::<LevelFilter>().ok()
}

/// Initialize stderr logging based on `POWERSHIELD_LOG`/`RUST_LOG`.
///
/// Safe to call more than once; only the first call installs the logger.
pub fn init_rust_logging() {
    init_with_level(env_level());
}

/// Like [`init_rust_logging`], but an explicit level (e.g. from a CLI flag) wins
/// over the environment.
pub fn init_with_level_str(level: Option<&str>) {
    let level = level.and_then(parse_level).unwrap_or_else(env_level);
    init_with_level(level);
}

fn init_with_level(level: LevelFilter) {
    RUST_LOG_ONCE.call_once(|| {
        env_logger::Builder::new()
            .filter_level(level)
            .format_timestamp_millis()
            .format_module_path(true)
            .format_target(true)
            .init();
        log::debug!("logging initialised at level {}", level_to_str(level));
    });
}
