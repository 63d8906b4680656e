// Structured Logging
// tracing + tracing-subscriber, initialised once per process

use tracing::Level;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::EnvFilter;
use std::sync::Once;

use crate::core::config::MonitoringConfig;

static INIT: Once = Once::new();

/// Transport crates that are far too chatty at debug level
const QUIET_TARGETS: [&str; 4] = ["tokio_tungstenite", "tungstenite", "hyper", "reqwest"];

/// Setup structured logging for the entire application
pub fn setup_logging(log_level: Option<&str>, json_format: Option<bool>) {
    let log_level_str = log_level.unwrap_or("INFO");
    let json_format = json_format.unwrap_or(false);
    let level = parse_level(log_level_str);

    INIT.call_once(|| {
        let mut filter = EnvFilter::from_default_env().add_directive(level.into());
        for target in QUIET_TARGETS {
            if let Ok(directive) = format!("{}=warn", target).parse::<Directive>() {
                filter = filter.add_directive(directive);
            }
        }

        // try_init: a host application may already own the global subscriber
        let installed = if json_format {
            tracing_subscriber::fmt()
                .json()
                .with_target(true)
                .with_thread_ids(true)
                .with_env_filter(filter)
                .try_init()
                .is_ok()
        } else {
            tracing_subscriber::fmt()
                .with_target(true)
                .with_env_filter(filter)
                .try_init()
                .is_ok()
        };

        if installed {
            tracing::info!(log_level = %log_level_str, json = json_format, "Logging initialized");
        }
    });
}

/// Setup logging from the monitoring section of the configuration
pub fn setup_logging_from_config(config: &MonitoringConfig) {
    setup_logging(Some(&config.log_level), Some(config.json_format));
}

fn parse_level(value: &str) -> Level {
    match value.to_uppercase().as_str() {
        "TRACE" => Level::TRACE,
        "DEBUG" => Level::DEBUG,
        "INFO" => Level::INFO,
        "WARN" | "WARNING" => Level::WARN,
        "ERROR" => Level::ERROR,
        _ => Level::INFO,
    }
}
