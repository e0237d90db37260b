//! Logging setup
//!
//! Installs a global `tracing` subscriber from [`LogConfig`]. `RUST_LOG`
//! directives are honored on top of the configured level.

use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

use crate::config::LogConfig;

fn parse_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Install the global subscriber
///
/// Returns `false` if the host process already installed one; the
/// interception layer then logs through that subscriber.
pub fn init_logging(config: &LogConfig) -> bool {
    let filter = EnvFilter::from_default_env().add_directive(parse_level(&config.level).into());

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.target)
        .with_thread_names(true)
        .with_span_events(FmtSpan::CLOSE);

    if config.format == "json" {
        subscriber.json().try_init().is_ok()
    } else {
        subscriber.try_init().is_ok()
    }
}
