//! Stdout sink, journald-friendly.

use std::io::Write;

use super::event::ConnectionEvent;
use super::EventSink;

/// Writes events to stdout, either as a text line or as one JSON record
/// per line.
#[derive(Debug)]
pub struct StdoutSink {
    use_json: bool,
}

impl StdoutSink {
    #[must_use]
    pub fn new(use_json: bool) -> Self {
        Self { use_json }
    }
}

impl EventSink for StdoutSink {
    fn log_event(&self, event: &ConnectionEvent) {
        let stdout = std::io::stdout();
        let mut handle = stdout.lock();

        if self.use_json {
            if let Ok(json) = serde_json::to_string(event) {
                let _ = writeln!(handle, "{json}");
            }
        } else {
            let _ = writeln!(
                handle,
                "[{}] {}",
                event.timestamp.format("%Y-%m-%d %H:%M:%S"),
                event.render_text()
            );
        }
    }

    fn flush(&self) {
        let _ = std::io::stdout().flush();
    }
}
