//! Tracing/logging initialization.
//!
//! Output format is chosen with `JOBFORGE_LOG_FORMAT` (`json`, the default, or
//! `pretty`); filtering follows `RUST_LOG`.

use tracing_subscriber::EnvFilter;

/// Log line format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

impl LogFormat {
    /// Read `JOBFORGE_LOG_FORMAT`, falling back to JSON.
    pub fn from_env() -> Self {
        match std::env::var("JOBFORGE_LOG_FORMAT") {
            Ok(value) => Self::parse(&value),
            Err(_) => LogFormat::Json,
        }
    }

    fn parse(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case("pretty") {
            LogFormat::Pretty
        } else {
            LogFormat::Json
        }
    }
}

/// Initialize tracing/logging for the process.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init() {
    init_with(LogFormat::from_env(), "info");
}

/// Initialize with an explicit format and a default filter used when
/// `RUST_LOG` is unset.
pub fn init_with(format: LogFormat, default_filter: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_thread_names(true);

    // JSON logs + timestamps for deployments, human-readable output for local runs.
    let installed = match format {
        LogFormat::Json => builder.json().with_target(false).try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
    };
    match installed {
        Ok(()) => ::tracing::debug!(?format, default_filter, "logging initialized"),
        Err(_) => ::tracing::trace!(?format, "logging already initialized; keeping the existing subscriber"),
    }
}
