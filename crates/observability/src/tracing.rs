//! Tracing/logging initialization.

use serde::Deserialize;
use tracing_subscriber::EnvFilter;

/// Output format of the process log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// One JSON object per line (for log shippers).
    #[default]
    Json,
    /// Human-oriented single-line text, for interactive cron debugging.
    Compact,
}

/// Initialize tracing/logging for the process.
///
/// Safe to call multiple times (subsequent calls are no-ops). The filter is
/// configurable via `RUST_LOG` and defaults to `info`.
pub fn init(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    // Job output goes to stderr so stdout stays free for the child processes
    // that inherit it.
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_timer(tracing_subscriber::fmt::time::SystemTime);

    let _ = match format {
        LogFormat::Json => builder.json().with_target(false).try_init(),
        LogFormat::Compact => builder.compact().with_target(false).try_init(),
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_deserializes_from_config_literals() {
        let json: LogFormat = serde_json::from_str("\"json\"").unwrap();
        let compact: LogFormat = serde_json::from_str("\"compact\"").unwrap();
        assert_eq!(json, LogFormat::Json);
        assert_eq!(compact, LogFormat::Compact);
    }

    #[test]
    fn init_twice_is_a_noop() {
        init(LogFormat::Compact);
        init(LogFormat::Json);
    }
}
