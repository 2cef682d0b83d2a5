//! Connection lifecycle event record.

use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::Protocol;

/// Lifecycle stage of a connection or session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Open,
    Update,
    Close,
}

impl EventType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            EventType::Open => "open",
            EventType::Update => "update",
            EventType::Close => "close",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A connection lifecycle event, consumed by the log sinks.
///
/// Packet counters are only present for UDP sessions.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionEvent {
    pub timestamp: DateTime<Utc>,
    pub listener_name: String,
    pub protocol: Protocol,
    pub source_ip: String,
    pub source_port: u16,
    pub target_ip: String,
    pub target_port: u16,
    pub event_type: EventType,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub packets_sent: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub packets_received: Option<u64>,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ConnectionEvent {
    /// Key=value text rendering shared by the stdout and syslog sinks.
    #[must_use]
    pub fn render_text(&self) -> String {
        let mut out = String::with_capacity(128);
        let _ = write!(
            out,
            "listener={} proto={} event={} src={}:{} dst={}:{}",
            self.listener_name,
            self.protocol,
            self.event_type,
            self.source_ip,
            self.source_port,
            self.target_ip,
            self.target_port,
        );

        if matches!(self.event_type, EventType::Close | EventType::Update) {
            let _ = write!(
                out,
                " duration={}ms bytes_sent={} bytes_recv={}",
                self.duration_ms, self.bytes_sent, self.bytes_received
            );

            if self.protocol == Protocol::Udp {
                let _ = write!(
                    out,
                    " pkts_sent={} pkts_recv={}",
                    self.packets_sent.unwrap_or(0),
                    self.packets_received.unwrap_or(0)
                );
            }

            if let Some(error) = &self.error {
                let _ = write!(out, " error={error:?}");
            }
        }

        out
    }
}
