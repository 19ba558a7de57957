//! Tracing subscriber setup for binaries and long-running hosts.

pub mod config;

pub use config::{LogFormat, TracingConfig};

use tracing_subscriber::EnvFilter;

/// Error returned when a global subscriber could not be installed
pub type InitError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Install the global `tracing` subscriber. Fails if one is already set or
/// the filter directives do not parse.
pub fn init_tracing(config: &TracingConfig) -> Result<(), InitError> {
    let filter = EnvFilter::try_new(&config.filter)?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.with_target);

    match config.format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Text => builder.try_init(),
    }
}
