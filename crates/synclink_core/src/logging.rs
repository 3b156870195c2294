//! Log levels, custom log sinks and the connection logger.
//!
//! Without a custom sink every message goes to `tracing` under the
//! `synclink` target. A custom [`LogSink`] replaces that path entirely; it
//! may be invoked from several connections at once and must do its own
//! synchronization. [`ChannelLogSink`] moves records across a channel so
//! the consumer can process them on a single task.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::level_filters::LevelFilter;

/// Sync logging threshold, from `Off` (nothing) to `All` (everything).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Nothing is logged.
    Off,
    /// Only fatal errors.
    Fatal,
    /// Errors.
    Error,
    /// Warnings and errors.
    Warn,
    /// Sync events, kept terse to avoid overhead.
    #[default]
    Info,
    /// More sync events than `Info`.
    Detail,
    /// Debugging information.
    Debug,
    /// More debugging information than `Debug`.
    Trace,
    /// Everything.
    All,
}

impl LogLevel {
    /// All levels in increasing verbosity.
    pub const ALL: [LogLevel; 9] = [
        LogLevel::Off,
        LogLevel::Fatal,
        LogLevel::Error,
        LogLevel::Warn,
        LogLevel::Info,
        LogLevel::Detail,
        LogLevel::Debug,
        LogLevel::Trace,
        LogLevel::All,
    ];

    /// Returns the lowercase name of this level.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Off => "off",
            LogLevel::Fatal => "fatal",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Detail => "detail",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
            LogLevel::All => "all",
        }
    }

    /// Returns true if a message at `message_level` passes this threshold.
    pub fn allows(&self, message_level: LogLevel) -> bool {
        message_level != LogLevel::Off && message_level <= *self
    }

    /// Maps this threshold onto the five `tracing` levels.
    ///
    /// `Fatal` shares `ERROR`, `Detail` shares `DEBUG` and `All` shares
    /// `TRACE`.
    pub fn to_level_filter(&self) -> LevelFilter {
        match self {
            LogLevel::Off => LevelFilter::OFF,
            LogLevel::Fatal | LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Detail | LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace | LogLevel::All => LevelFilter::TRACE,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LogLevel::ALL
            .iter()
            .copied()
            .find(|level| level.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown log level '{s}'"))
    }
}

/// A log message produced by the connection manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Severity.
    pub level: LogLevel,
    /// Formatted message.
    pub message: String,
}

/// Receives log messages in place of `tracing`.
///
/// Implementations may be called from multiple threads simultaneously.
pub trait LogSink: Send + Sync {
    /// Handles one log message.
    fn log(&self, level: LogLevel, message: &str);
}

impl<F> LogSink for F
where
    F: Fn(LogLevel, &str) + Send + Sync,
{
    fn log(&self, level: LogLevel, message: &str) {
        self(level, message)
    }
}

/// A log sink that forwards records to an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelLogSink {
    tx: mpsc::UnboundedSender<LogRecord>,
}

impl ChannelLogSink {
    /// Creates a sink and the receiver its records arrive on.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<LogRecord>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl LogSink for ChannelLogSink {
    fn log(&self, level: LogLevel, message: &str) {
        // A dropped receiver just means nobody is listening any more.
        let _ = self.tx.send(LogRecord {
            level,
            message: message.to_string(),
        });
    }
}

/// Level-gated logger shared by every connection of a manager.
#[derive(Clone, Default)]
pub struct SyncLogger {
    level: LogLevel,
    sink: Option<Arc<dyn LogSink>>,
}

impl SyncLogger {
    /// Creates a logger that writes to `tracing`.
    pub fn new(level: LogLevel) -> Self {
        Self { level, sink: None }
    }

    /// Creates a logger that writes to a custom sink.
    pub fn with_sink(level: LogLevel, sink: Arc<dyn LogSink>) -> Self {
        Self {
            level,
            sink: Some(sink),
        }
    }

    /// Returns the threshold.
    pub fn level(&self) -> LogLevel {
        self.level
    }

    /// Returns true if messages at `level` are emitted.
    pub fn enabled(&self, level: LogLevel) -> bool {
        self.level.allows(level)
    }

    /// Logs a message, formatting it only if the level is enabled.
    pub fn log<F>(&self, level: LogLevel, message: F)
    where
        F: FnOnce() -> String,
    {
        if !self.enabled(level) {
            return;
        }
        let message = message();
        match &self.sink {
            Some(sink) => sink.log(level, &message),
            None => emit_tracing(level, &message),
        }
    }

    /// Logs at `Info`.
    pub fn info<F: FnOnce() -> String>(&self, message: F) {
        self.log(LogLevel::Info, message)
    }

    /// Logs at `Detail`.
    pub fn detail<F: FnOnce() -> String>(&self, message: F) {
        self.log(LogLevel::Detail, message)
    }

    /// Logs at `Debug`.
    pub fn debug<F: FnOnce() -> String>(&self, message: F) {
        self.log(LogLevel::Debug, message)
    }

    /// Logs at `Trace`.
    pub fn trace<F: FnOnce() -> String>(&self, message: F) {
        self.log(LogLevel::Trace, message)
    }

    /// Logs at `Warn`.
    pub fn warn<F: FnOnce() -> String>(&self, message: F) {
        self.log(LogLevel::Warn, message)
    }
}

impl fmt::Debug for SyncLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncLogger")
            .field("level", &self.level)
            .field("custom_sink", &self.sink.is_some())
            .finish()
    }
}

fn emit_tracing(level: LogLevel, message: &str) {
    match level {
        LogLevel::Off => {}
        LogLevel::Fatal => tracing::error!(target: "synclink", fatal = true, "{}", message),
        LogLevel::Error => tracing::error!(target: "synclink", "{}", message),
        LogLevel::Warn => tracing::warn!(target: "synclink", "{}", message),
        LogLevel::Info => tracing::info!(target: "synclink", "{}", message),
        LogLevel::Detail => tracing::debug!(target: "synclink", detail = true, "{}", message),
        LogLevel::Debug => tracing::debug!(target: "synclink", "{}", message),
        LogLevel::Trace | LogLevel::All => tracing::trace!(target: "synclink", "{}", message),
    }
}
