// Log event sink injected on the client.
//
// The core never writes to a concrete logging backend directly: every
// level-tagged event goes through the client's `LogSink`. The default
// sink forwards to the `tracing` ecosystem; tests can inject a capturing
// sink instead.

use tracing::{debug, error, info, warn};

/// Severity of a log event emitted by the client core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Destination for level-tagged log events.
pub trait LogSink: Send + Sync {
    fn log(&self, level: LogLevel, message: &str);

    fn debug(&self, message: &str) {
        self.log(LogLevel::Debug, message);
    }

    fn info(&self, message: &str) {
        self.log(LogLevel::Info, message);
    }

    fn warn(&self, message: &str) {
        self.log(LogLevel::Warn, message);
    }

    fn error(&self, message: &str) {
        self.log(LogLevel::Error, message);
    }
}

/// Default sink: forwards events to `tracing`.
#[derive(Debug, Default)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn log(&self, level: LogLevel, message: &str) {
        match level {
            LogLevel::Debug => debug!(target: "rmq_stream", "{message}"),
            LogLevel::Info => info!(target: "rmq_stream", "{message}"),
            LogLevel::Warn => warn!(target: "rmq_stream", "{message}"),
            LogLevel::Error => error!(target: "rmq_stream", "{message}"),
        }
    }
}

/// Sink that drops every event.
#[derive(Debug, Default)]
pub struct NopSink;

impl LogSink for NopSink {
    fn log(&self, _level: LogLevel, _message: &str) {}
}
