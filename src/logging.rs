//! Logging setup for the kit worker.
//!
//! The worker is forked by a supervisor, so logging is (re)configured from
//! the environment rather than the command line:
//!
//! - `LOOL_LOGLEVEL` - log level: error, warn, info, debug, trace
//! - `LOOL_LOGCOLOR` - enable ANSI colors when set
//! - `LOOL_LOGFILE` - log to a file when set
//! - `LOOL_LOGFILENAME` - path of the log file

use std::path::PathBuf;

use tracing::Level;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    EnvFilter,
    fmt,
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

/// Logging configuration, normally built via [`LogConfig::from_env`].
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Base log level (default: INFO).
    pub level: Level,
    /// Enable ANSI colors on stderr.
    pub color: bool,
    /// Path to a log file (None = stderr only).
    pub file_path: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            color: false,
            file_path: None,
        }
    }
}

impl LogConfig {
    /// Build the configuration from the `LOOL_*` environment.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(level_str) = std::env::var("LOOL_LOGLEVEL") {
            config.level = parse_level(&level_str).unwrap_or(config.level);
        }

        config.color = std::env::var_os("LOOL_LOGCOLOR").is_some();

        if std::env::var_os("LOOL_LOGFILE").is_some()
            && let Ok(path) = std::env::var("LOOL_LOGFILENAME")
        {
            config.file_path = Some(PathBuf::from(path));
        }

        config
    }

    fn build_filter(&self) -> EnvFilter {
        EnvFilter::new(format!("{}", self.level).to_lowercase())
    }
}

/// Parse a log level string.
fn parse_level(s: &str) -> Option<Level> {
    match s.to_lowercase().as_str() {
        "error" | "fatal" => Some(Level::ERROR),
        "warn" | "warning" => Some(Level::WARN),
        "info" => Some(Level::INFO),
        "debug" => Some(Level::DEBUG),
        "trace" => Some(Level::TRACE),
        _ => None,
    }
}

/// Initialize the global tracing subscriber.
///
/// Called once per process after the fork; subsequent calls are silently
/// ignored so the worker can re-initialize without tripping over the
/// supervisor's subscriber.
pub fn init(config: &LogConfig) {
    let filter = config.build_filter();

    let stderr_layer = fmt::layer()
        .with_ansi(config.color)
        .with_target(true)
        .with_writer(std::io::stderr);

    let result = if let Some(ref path) = config.file_path {
        let parent = path.parent().unwrap_or(std::path::Path::new("."));
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("kitworker.log");
        let appender = RollingFileAppender::new(Rotation::NEVER, parent, file_name);

        let file_layer = fmt::layer()
            .with_ansi(false)
            .with_target(true)
            .with_writer(appender);

        tracing_subscriber::registry()
            .with(filter)
            .with(stderr_layer)
            .with(file_layer)
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(stderr_layer)
            .try_init()
    };

    // Idempotent: ignore "already initialized".
    let _ = result;
}
