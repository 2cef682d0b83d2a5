//! Connection event logging.
//!
//! Lifecycle events are strongly typed [`ConnectionEvent`] records fanned
//! out by [`MultiLogger`] to every enabled sink: stdout, a JSON-lines
//! file, and syslog. Sinks are write-only and best-effort; a failing sink
//! never disturbs the forwarding path. Process diagnostics go through
//! `tracing` instead.

mod event;
mod jsonlog;
mod stdout;
mod syslog;

pub use event::{ConnectionEvent, EventType};
pub use jsonlog::JsonFileSink;
pub use stdout::StdoutSink;
pub use syslog::SyslogSink;

use thiserror::Error;

use crate::config::LoggingConfig;

/// Result alias for sink construction.
pub type LogResult<T> = Result<T, LogError>;

/// Errors raised while setting up log sinks.
#[derive(Debug, Error)]
pub enum LogError {
    /// The JSON log file could not be opened.
    #[error("failed to open JSON log {path}: {source}")]
    OpenFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The syslog transport could not be established.
    #[error("failed to connect to syslog: {0}")]
    Syslog(#[source] std::io::Error),

    /// The configuration enables no sink at all.
    #[error("no logging sinks enabled")]
    NoSinksEnabled,
}

/// A write-only destination for connection events.
pub trait EventSink: Send + Sync {
    /// Record one event. Failures are handled inside the sink.
    fn log_event(&self, event: &ConnectionEvent);

    /// Flush buffered output.
    fn flush(&self) {}
}

/// Fans events out to every enabled sink.
pub struct MultiLogger {
    sinks: Vec<Box<dyn EventSink>>,
}

impl std::fmt::Debug for MultiLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiLogger")
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

impl MultiLogger {
    /// Build the logger from the logging configuration.
    ///
    /// # Errors
    ///
    /// Returns an error when a sink cannot be constructed or when no sink
    /// is enabled.
    pub fn new(cfg: &LoggingConfig) -> LogResult<Self> {
        let mut sinks: Vec<Box<dyn EventSink>> = Vec::new();

        if cfg.syslog.enabled {
            sinks.push(Box::new(SyslogSink::new(&cfg.syslog)?));
        }
        if cfg.jsonlog.enabled {
            sinks.push(Box::new(JsonFileSink::new(&cfg.jsonlog.path)?));
        }
        if cfg.stdout.enabled {
            sinks.push(Box::new(StdoutSink::new(cfg.stdout.use_json)));
        }

        if sinks.is_empty() {
            return Err(LogError::NoSinksEnabled);
        }

        Ok(Self { sinks })
    }

    /// Record one event on every sink.
    pub fn log_event(&self, event: &ConnectionEvent) {
        for sink in &self.sinks {
            sink.log_event(event);
        }
    }

    /// Flush every sink.
    pub fn flush(&self) {
        for sink in &self.sinks {
            sink.flush();
        }
    }

    /// Number of active sinks.
    #[must_use]
    pub fn sink_count(&self) -> usize {
        self.sinks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{JsonLogConfig, StdoutConfig};

    #[test]
    fn test_no_sinks_enabled() {
        let result = MultiLogger::new(&LoggingConfig::default());
        assert!(matches!(result, Err(LogError::NoSinksEnabled)));
    }

    #[test]
    fn test_stdout_only() {
        let cfg = LoggingConfig {
            stdout: StdoutConfig {
                enabled: true,
                use_json: true,
            },
            ..LoggingConfig::default()
        };
        let logger = MultiLogger::new(&cfg).unwrap();
        assert_eq!(logger.sink_count(), 1);
    }

    #[test]
    fn test_multiple_sinks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.json");

        let cfg = LoggingConfig {
            stdout: StdoutConfig {
                enabled: true,
                use_json: false,
            },
            jsonlog: JsonLogConfig {
                enabled: true,
                path: path.to_str().unwrap().to_string(),
            },
            ..LoggingConfig::default()
        };
        let logger = MultiLogger::new(&cfg).unwrap();
        assert_eq!(logger.sink_count(), 2);
    }

    #[test]
    fn test_sink_construction_failure_propagates() {
        let cfg = LoggingConfig {
            jsonlog: JsonLogConfig {
                enabled: true,
                path: "/nonexistent-dir/events.json".to_string(),
            },
            ..LoggingConfig::default()
        };
        assert!(MultiLogger::new(&cfg).is_err());
    }
}
