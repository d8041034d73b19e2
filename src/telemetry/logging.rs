use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Registry,
};

use crate::config::Settings;
use crate::error::Error;
use crate::types::Result;

/// Parse a configured log level, falling back to INFO
fn parse_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Initialize the logging system
pub fn init_logging(settings: &Settings) -> Result<()> {
    let log_level = parse_level(&settings.general.log_level);

    // RUST_LOG directives take precedence over the configured level
    let filter = EnvFilter::builder()
        .with_default_directive(log_level.into())
        .from_env_lossy();

    let registry = Registry::default().with(filter);

    let result = if settings.telemetry.structured_logging {
        registry
            .with(
                fmt::Layer::default()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_span_events(FmtSpan::CLOSE)
                    .json(),
            )
            .try_init()
    } else {
        registry
            .with(
                fmt::Layer::default()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_span_events(FmtSpan::CLOSE)
                    .with_ansi(true),
            )
            .try_init()
    };

    result.map_err(|e| Error::Internal(format!("Failed to set global default subscriber: {}", e)))
}

/// Install a test subscriber; safe to call from several tests
#[cfg(test)]
pub fn init_test_logging() {
    let filter = EnvFilter::builder()
        .with_default_directive(Level::DEBUG.into())
        .from_env_lossy();

    let _ = Registry::default()
        .with(filter)
        .with(fmt::Layer::default().with_test_writer().with_target(true).with_ansi(false))
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("DEBUG"), Level::DEBUG);
        assert_eq!(parse_level("warn"), Level::WARN);
        assert_eq!(parse_level("verbose"), Level::INFO);
    }

    #[test]
    fn test_init_twice_is_an_error() {
        init_test_logging();
        let settings = Settings::default();
        assert!(init_logging(&settings).is_err());
    }
}
