//! Tracing/logging initialization.
//!
//! - filter: `RUST_LOG`, else `LOG_LEVEL`, else `info`
//! - format: JSON lines by default, `LOG_FORMAT=pretty` for humans

use tracing_subscriber::EnvFilter;

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

impl LogFormat {
    /// Anything other than `pretty` (case-insensitive) means JSON.
    pub fn parse(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some(v) if v.eq_ignore_ascii_case("pretty") => LogFormat::Pretty,
            _ => LogFormat::Json,
        }
    }
}

/// Filter directive from `RUST_LOG`, then `LOG_LEVEL`, then `info`.
pub fn filter_directive(rust_log: Option<String>, log_level: Option<String>) -> String {
    rust_log
        .filter(|v| !v.trim().is_empty())
        .or_else(|| log_level.filter(|v| !v.trim().is_empty()))
        .map(|v| v.trim().to_lowercase())
        .unwrap_or_else(|| "info".to_string())
}

/// Initialize tracing/logging for the process.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init() {
    let directive = filter_directive(std::env::var("RUST_LOG").ok(), std::env::var("LOG_LEVEL").ok());
    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new("info"));
    let format = LogFormat::parse(std::env::var("LOG_FORMAT").ok().as_deref());

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::SystemTime);

    let installed = match format {
        LogFormat::Json => builder.json().with_target(false).try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
    };

    if installed.is_ok() {
        ::tracing::debug!(filter = %directive, format = ?format, "logging initialized");
    }
}
