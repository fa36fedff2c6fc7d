/*!
 * Tracing setup for Liaison.
 */
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LoggingConfig;
use crate::error::{Error, Result};

/// Install the global subscriber described by the logging section.
///
/// `RUST_LOG` takes precedence over the configured level. Fails if a
/// subscriber is already installed.
pub fn init_with_config(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let result = if config.json_format {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_target(true))
            .with(filter)
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_target(true))
            .with(filter)
            .try_init()
    };

    result.map_err(|e| Error::runtime(format!("Failed to initialize logging: {}", e)))
}

/// A type alias for a tracing span
pub type Span = tracing::Span;

/// Span for one component instance, e.g. a TPad on a port
pub fn component_span(name: &str, id: Option<&str>) -> Span {
    match id {
        Some(id) => tracing::info_span!("component", name = %name, id = %id),
        None => tracing::info_span!("component", name = %name),
    }
}

/// Span for one operation performed by a component
pub fn operation_span(name: &str, component: &str) -> Span {
    tracing::info_span!("operation", name = %name, component = %component)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_twice_reports_error() {
        let config = LoggingConfig {
            level: "debug".to_string(),
            json_format: false,
        };
        // The first call may race with other tests installing a subscriber,
        // but a second call in the same process must always fail.
        let _ = init_with_config(&config);
        assert!(init_with_config(&config).is_err());
    }

    #[test]
    fn test_spans_without_subscriber_interest() {
        let span = component_span("tpad", Some("COM3"));
        let _entered = span.enter();
        let span = operation_span("reset_timer", "tpad");
        let _entered = span.enter();
    }
}
