//! Structured logging setup.
//!
//! Interactive terminals get stdout only. Otherwise logs go to stdout and a
//! daily rotating `querypad.*.log` file, falling back to stdout when the log
//! directory is unusable.
//!
//! Filter priority: explicit filter > `QUERYPAD_LOG` > `RUST_LOG` > build default.

use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "QUERYPAD_LOG";
const LOG_FILE_PREFIX: &str = "querypad";

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Directory for log files
    pub log_dir: PathBuf,
    /// Skip the log file and write to stdout only
    pub console_only: bool,
    /// Explicit filter directive
    pub log_filter: Option<String>,
}

impl LogConfig {
    /// File logging into `log_dir` unless stdout is a terminal.
    pub fn new(log_dir: PathBuf) -> Self {
        Self { log_dir, console_only: atty::is(atty::Stream::Stdout), log_filter: None }
    }

    /// Log into `<data_dir>/logs`.
    pub fn for_data_dir(data_dir: &Path) -> Self {
        Self::new(data_dir.join("logs"))
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.log_filter = Some(filter.into());
        self
    }
}

/// Keeps the file writer alive. Dropping it flushes pending entries.
pub struct LoggingGuard {
    _worker_guard: Option<WorkerGuard>,
}

/// Install the global subscriber.
///
/// A second call leaves the first subscriber in place.
pub fn init_logging(config: LogConfig) -> LoggingGuard {
    let filter = select_filter(
        config.log_filter.as_deref(),
        std::env::var(LOG_ENV).ok(),
        std::env::var("RUST_LOG").ok(),
    );

    if config.console_only {
        return init_stdout_logging(&filter);
    }

    match init_file_logging(&config.log_dir, &filter) {
        Ok(guard) => LoggingGuard { _worker_guard: Some(guard) },
        Err(e) => {
            eprintln!("Warning: Failed to initialize file logging: {e}. Using console only.");
            init_stdout_logging(&filter)
        }
    }
}

fn init_stdout_logging(filter: &str) -> LoggingGuard {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter(filter))
        .with_target(false)
        .try_init();
    LoggingGuard { _worker_guard: None }
}

fn init_file_logging(
    log_dir: &Path,
    filter: &str,
) -> Result<WorkerGuard, Box<dyn std::error::Error + Send + Sync>> {
    std::fs::create_dir_all(log_dir)?;

    let file_appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix("log")
        .build(log_dir)?;
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let writer = std::io::stdout.with_max_level(tracing::Level::INFO).and(file_writer);

    tracing_subscriber::fmt()
        .with_writer(writer)
        .with_env_filter(env_filter(filter))
        .with_ansi(false)
        .with_target(true)
        .try_init()?;

    Ok(guard)
}

fn env_filter(directive: &str) -> EnvFilter {
    EnvFilter::try_new(directive).unwrap_or_else(|_| EnvFilter::new(default_log_filter()))
}

/// Pick the filter directive by priority.
fn select_filter(explicit: Option<&str>, querypad_log: Option<String>, rust_log: Option<String>) -> String {
    explicit
        .map(str::to_string)
        .or(querypad_log)
        .or(rust_log)
        .filter(|f| !f.trim().is_empty())
        .unwrap_or_else(|| default_log_filter().to_string())
}

/// Default filter for this build type.
pub fn default_log_filter() -> &'static str {
    if cfg!(debug_assertions) {
        "debug,querypad_core=trace,tokio_postgres=info,russh=info"
    } else {
        "info,tokio_postgres=warn,russh=warn"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_priority() {
        let env = || Some("querypad_core=debug".to_string());
        let rust = || Some("warn".to_string());

        assert_eq!(select_filter(Some("error"), env(), rust()), "error");
        assert_eq!(select_filter(None, env(), rust()), "querypad_core=debug");
        assert_eq!(select_filter(None, None, rust()), "warn");
        assert_eq!(select_filter(None, None, None), default_log_filter());
    }

    #[test]
    fn test_blank_filter_falls_back_to_default() {
        assert_eq!(select_filter(None, Some("  ".to_string()), None), default_log_filter());
    }

    #[test]
    fn test_log_dir_under_data_dir() {
        let config = LogConfig::for_data_dir(Path::new("/tmp/qp")).with_filter("info");
        assert_eq!(config.log_dir, PathBuf::from("/tmp/qp/logs"));
        assert_eq!(config.log_filter.as_deref(), Some("info"));
    }
}
