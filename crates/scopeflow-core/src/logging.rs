/*!
 * Logging functionality for ScopeFlow.
 *
 * Tracing setup and span helpers shared by the hub and the device facades.
 */
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LoggingConfig;
use crate::error::{Error, Result};

/// Initialize the logging system with default configuration
pub fn init() -> Result<()> {
    init_with_filter("info")
}

/// Initialize the logging system with a specific filter
///
/// `RUST_LOG` takes precedence over `filter` when it is set.
///
/// # Arguments
///
/// * `filter` - The log filter string (e.g., "info", "debug", "scopeflow_devices=trace")
pub fn init_with_filter(filter: &str) -> Result<()> {
    install(filter, true)
}

/// Initialize the logging system from the logging section of the configuration
pub fn init_from_config(config: &LoggingConfig) -> Result<()> {
    install(&config.level, config.show_target)
}

fn install(filter: &str, with_target: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(filter))
        .map_err(|e| Error::logging(format!("Invalid log filter {:?}: {}", filter, e)))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(with_target))
        .with(filter)
        .try_init()
        .map_err(|e| Error::logging(format!("Failed to initialize logging: {}", e)))?;

    Ok(())
}

/// A type alias for a tracing span
pub type Span = tracing::Span;

/// Create a new span for a component
///
/// # Arguments
///
/// * `name` - The name of the component
/// * `id` - An optional ID for the component instance
pub fn component_span(name: &str, id: Option<&str>) -> Span {
    match id {
        Some(id) => tracing::info_span!("component", name = %name, id = %id),
        None => tracing::info_span!("component", name = %name),
    }
}

/// Create a new span for an operation
///
/// # Arguments
///
/// * `name` - The name of the operation
/// * `component` - The component performing the operation
pub fn operation_span(name: &str, component: &str) -> Span {
    tracing::debug_span!("operation", name = %name, component = %component)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_twice_fails_cleanly() {
        // The first call may already have happened in another test
        let _ = init();
        assert!(matches!(init(), Err(Error::Logging(_))));
    }

    #[test]
    fn test_spans_without_subscriber_interest() {
        let span = component_span("lamp", Some("lamp-1"));
        let _entered = span.enter();
        let op = operation_span("open", "lamp");
        if let Some(meta) = op.metadata() {
            assert_eq!(meta.name(), "operation");
        }
    }
}
