//! Logging configuration
//!
//! Loaded from environment variables:
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | RUST_LOG | info | `EnvFilter` directives |
//! | FANOUT_LOG_FORMAT | text | `text` or `json` |
//! | FANOUT_LOG_TARGET | true | Include the event target |

/// Output format for log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    /// One JSON object per line, for log shippers
    Json,
}

impl LogFormat {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "text" | "plain" | "pretty" => Some(LogFormat::Text),
            "json" => Some(LogFormat::Json),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TracingConfig {
    pub filter: String,
    pub format: LogFormat,
    pub with_target: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        TracingConfig {
            filter: "info".to_string(),
            format: LogFormat::Text,
            with_target: true,
        }
    }
}

impl TracingConfig {
    pub fn from_env() -> Self {
        let defaults = TracingConfig::default();
        TracingConfig {
            filter: std::env::var("RUST_LOG")
                .ok()
                .filter(|s| !s.trim().is_empty())
                .unwrap_or(defaults.filter),
            format: std::env::var("FANOUT_LOG_FORMAT")
                .ok()
                .and_then(|s| LogFormat::parse(&s))
                .unwrap_or(defaults.format),
            with_target: std::env::var("FANOUT_LOG_TARGET")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(defaults.with_target),
        }
    }
}
