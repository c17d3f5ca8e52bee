//! Logging sink.
//!
//! The host never logs directly. Every component reports through a [`LogSink`],
//! and [`NullLog`] is the default so embedding applications opt in explicitly.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Verbosity of a log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Simple,
    Intermediate,
    Verbose,
}

/// Receives leveled log lines.
pub trait LogSink: Send + Sync {
    fn print(&self, message: &str, level: LogLevel);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullLog;

impl LogSink for NullLog {
    fn print(&self, _message: &str, _level: LogLevel) {}
}

/// Forwards to `tracing` under the `plughost` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLog;

impl LogSink for TracingLog {
    fn print(&self, message: &str, level: LogLevel) {
        match level {
            LogLevel::Simple => tracing::info!(target: "plughost", "{}", message),
            LogLevel::Intermediate => tracing::debug!(target: "plughost", "{}", message),
            LogLevel::Verbose => tracing::trace!(target: "plughost", "{}", message),
        }
    }
}

pub fn null_log() -> Arc<dyn LogSink> {
    Arc::new(NullLog)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levels_are_ordered() {
        assert!(LogLevel::Simple < LogLevel::Intermediate);
        assert!(LogLevel::Intermediate < LogLevel::Verbose);
    }

    #[test]
    fn test_sinks_accept_lines() {
        null_log().print("ignored", LogLevel::Simple);
        TracingLog.print("forwarded", LogLevel::Verbose);
    }
}
