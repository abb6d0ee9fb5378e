//! Structured logging setup with console and file output.
//!
//! Provides:
//! - Daily rotating log files for the console process, stdout when that fails
//! - Build-type conditional log levels
//! - Environment variable override via PGDECK_LOG or RUST_LOG
//! - A synchronous per-job diagnostic log for the detached executor

use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

/// Logging configuration.
pub struct LogConfig {
    /// Directory for log files
    pub log_dir: PathBuf,
    /// Whether running in a PTY (affects output formatting)
    pub is_pty: bool,
    /// Optional custom log filter
    pub log_filter: Option<String>,
}

impl LogConfig {
    /// Create a new logging configuration.
    pub fn new(log_dir: PathBuf) -> Self {
        Self { log_dir, is_pty: atty::is(atty::Stream::Stdout), log_filter: None }
    }

    /// Log into the console's configured log directory.
    pub fn from_console(config: &crate::config::ConsoleConfig) -> Self {
        Self::new(config.log_dir.clone())
    }

    /// Set custom log filter.
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.log_filter = Some(filter.into());
        self
    }
}

/// Where console output ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogSink {
    /// stdout only
    Console,
    /// Daily files in this directory, `INFO` and above mirrored to stdout
    File(PathBuf),
}

/// Guard that must be held for the lifetime of the application.
///
/// Dropping this guard flushes pending file log entries.
pub struct LoggingGuard {
    sink: LogSink,
    installed: bool,
    _worker_guard: Option<WorkerGuard>,
}

impl LoggingGuard {
    pub fn sink(&self) -> &LogSink {
        &self.sink
    }

    /// False when another global subscriber was already in place.
    pub fn installed(&self) -> bool {
        self.installed
    }
}

/// Install the console process subscriber.
///
/// Interactive terminals log to stdout only. Otherwise logs go to a daily rolling file
/// in `config.log_dir`; if that directory is unusable, stdout is used instead. Calling
/// this again is harmless: the first installed subscriber stays.
pub fn init_logging(config: &LogConfig) -> LoggingGuard {
    let filter = build_env_filter(config.log_filter.as_deref());
    if config.is_pty {
        return install_console(filter);
    }

    let (writer, worker_guard) = match rolling_file(&config.log_dir) {
        Ok(parts) => parts,
        Err(e) => {
            eprintln!(
                "Warning: cannot log to {}: {e}. Using console only.",
                config.log_dir.display()
            );
            return install_console(filter);
        }
    };

    let writer = std::io::stdout.with_max_level(tracing::Level::INFO).and(writer);
    let installed = tracing_subscriber::fmt()
        .with_writer(writer)
        .with_env_filter(filter)
        .with_ansi(false)
        .with_target(true)
        .try_init()
        .is_ok();
    report_install(installed);

    LoggingGuard {
        sink: LogSink::File(config.log_dir.clone()),
        installed,
        _worker_guard: Some(worker_guard),
    }
}

/// Install logging for a console configured by `config`.
pub fn init_console_logging(config: &crate::config::ConsoleConfig) -> LoggingGuard {
    init_logging(&LogConfig::from_console(config))
}

fn install_console(filter: EnvFilter) -> LoggingGuard {
    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(true)
        .with_target(false)
        .try_init()
        .is_ok();
    report_install(installed);
    LoggingGuard { sink: LogSink::Console, installed, _worker_guard: None }
}

fn report_install(installed: bool) {
    if !installed {
        tracing::debug!("A global subscriber is already installed, keeping it");
    }
}

fn rolling_file(dir: &Path) -> io::Result<(NonBlocking, WorkerGuard)> {
    std::fs::create_dir_all(dir)?;
    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("pgdeck")
        .filename_suffix("log")
        .build(dir)
        .map_err(io::Error::other)?;
    Ok(tracing_appender::non_blocking(appender))
}

fn build_env_filter(custom_filter: Option<&str>) -> EnvFilter {
    // Priority: custom filter > PGDECK_LOG > RUST_LOG > default
    if let Some(filter) = custom_filter {
        return EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new(default_log_filter()));
    }

    EnvFilter::try_from_env("PGDECK_LOG")
        .or_else(|_| EnvFilter::try_from_env("RUST_LOG"))
        .unwrap_or_else(|_| EnvFilter::new(default_log_filter()))
}

/// Default log filter for the build type.
pub fn default_log_filter() -> &'static str {
    #[cfg(debug_assertions)]
    {
        "debug,pgdeck_core=trace,pgdeck_executor=trace,tokio_postgres=warn,russh=warn"
    }
    #[cfg(not(debug_assertions))]
    {
        "info,pgdeck_core=info,pgdeck_executor=info,tokio_postgres=warn,russh=warn"
    }
}

/// Shared handle on a job's diagnostic log file.
///
/// Writes go straight to the file under a lock. No background thread is involved, so
/// the subscriber keeps working in a process that forked after installing it.
#[derive(Clone)]
pub struct JobLogWriter {
    file: Arc<Mutex<File>>,
}

impl JobLogWriter {
    /// Open (append) the log file at `path`.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { file: Arc::new(Mutex::new(file)) })
    }
}

/// One locked write through a [`JobLogWriter`].
pub struct JobLogLine<'a> {
    file: parking_lot::MutexGuard<'a, File>,
}

impl Write for JobLogLine<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl<'a> MakeWriter<'a> for JobLogWriter {
    type Writer = JobLogLine<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        JobLogLine { file: self.file.lock() }
    }
}

/// Route all tracing output of the executor to its diagnostic log `path`.
///
/// The filter honours PGDECK_LOG and RUST_LOG and defaults to `debug`, since this log
/// exists for post-mortem diagnosis of one job.
pub fn init_job_logging(path: &Path) -> io::Result<()> {
    let writer = JobLogWriter::open(path)?;
    let env_filter = EnvFilter::try_from_env("PGDECK_LOG")
        .or_else(|_| EnvFilter::try_from_env("RUST_LOG"))
        .unwrap_or_else(|_| EnvFilter::new("debug"));

    tracing_subscriber::fmt()
        .with_writer(writer)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .with_target(false)
        .with_thread_ids(false)
        .try_init()
        .map_err(|e| io::Error::other(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing::level_filters::LevelFilter;

    #[test]
    fn test_custom_filter_wins() {
        let filter = build_env_filter(Some("error,pgdeck_core=debug"));
        assert_eq!(filter.max_level_hint(), Some(LevelFilter::DEBUG));
    }

    #[test]
    fn test_bad_custom_filter_falls_back() {
        let filter = build_env_filter(Some("pgdeck_core=loudest"));
        assert!(filter.max_level_hint() >= Some(LevelFilter::INFO));
    }

    #[test]
    fn test_console_log_dir_is_used() {
        let console = crate::config::ConsoleConfig {
            log_dir: PathBuf::from("/srv/pgdeck/logs"),
            ..crate::config::ConsoleConfig::default()
        };
        let config = LogConfig::from_console(&console).with_filter("warn");
        assert_eq!(config.log_dir, PathBuf::from("/srv/pgdeck/logs"));
        assert_eq!(config.log_filter.as_deref(), Some("warn"));
    }

    fn file_config(log_dir: PathBuf) -> LogConfig {
        LogConfig { log_dir, is_pty: false, log_filter: Some("warn".to_string()) }
    }

    #[test]
    fn test_rolling_file_sink_and_repeated_install() {
        let dir = tempfile::tempdir().unwrap();
        let log_dir = dir.path().join("logs");

        let first = init_logging(&file_config(log_dir.clone()));
        assert_eq!(first.sink(), &LogSink::File(log_dir.clone()));
        assert!(log_dir.is_dir());

        // Whoever installed first, a subscriber is in place now.
        let second = init_logging(&file_config(log_dir.clone()));
        assert!(!second.installed());
        assert_eq!(second.sink(), &LogSink::File(log_dir));
    }

    #[test]
    fn test_unusable_log_dir_falls_back_to_console() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not_a_dir");
        std::fs::write(&blocker, b"").unwrap();

        let guard = init_logging(&file_config(blocker.join("logs")));
        assert_eq!(guard.sink(), &LogSink::Console);
        assert!(!blocker.join("logs").exists());
    }

    #[test]
    fn test_interactive_terminal_logs_to_console() {
        let dir = tempfile::tempdir().unwrap();
        let config = LogConfig { is_pty: true, ..file_config(dir.path().join("logs")) };

        let guard = init_logging(&config);
        assert_eq!(guard.sink(), &LogSink::Console);
        assert!(!dir.path().join("logs").exists());
    }

    #[test]
    fn test_job_log_writer_appends_under_lock() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log_1");
        let writer = JobLogWriter::open(&path).unwrap();

        writer.make_writer().write_all(b"first\n").unwrap();
        let clone = writer.clone();
        clone.make_writer().write_all(b"second\n").unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "first\nsecond\n");
    }
}
