//! JSON-lines file sink.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::sync::Mutex;

use tracing::warn;

use super::event::ConnectionEvent;
use super::{EventSink, LogError, LogResult};

/// Appends one JSON record per event to a file.
#[derive(Debug)]
pub struct JsonFileSink {
    file: Mutex<File>,
}

impl JsonFileSink {
    /// Open (or create) the log file for appending.
    pub fn new(path: &str) -> LogResult<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|source| LogError::OpenFile {
                path: path.to_string(),
                source,
            })?;

        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

impl EventSink for JsonFileSink {
    fn log_event(&self, event: &ConnectionEvent) {
        let json = match serde_json::to_string(event) {
            Ok(json) => json,
            Err(e) => {
                warn!(error = %e, "failed to encode connection event");
                return;
            }
        };

        let mut file = self.file.lock().unwrap();
        if let Err(e) = writeln!(file, "{json}") {
            warn!(error = %e, "failed to write connection event to JSON log");
        }
    }

    fn flush(&self) {
        let _ = self.file.lock().unwrap().flush();
    }
}
