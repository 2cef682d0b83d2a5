//! Syslog sink with RFC 3164 framing over UDP, TCP, or a Unix datagram
//! socket.

use std::io::Write;
use std::net::{TcpStream, UdpSocket};
use std::os::unix::net::UnixDatagram;
use std::sync::Mutex;

use chrono::Local;
use tracing::warn;

use crate::config::SyslogConfig;

use super::event::{ConnectionEvent, EventType};
use super::{EventSink, LogError, LogResult};

/// Syslog facility: daemon.
const FACILITY_DAEMON: u8 = 3;

/// Default local syslog socket paths, tried in order.
const LOCAL_SOCKETS: &[&str] = &["/dev/log", "/var/run/syslog"];

/// RFC 3164 severities, lower is more severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Severity {
    Error = 3,
    Warning = 4,
    Info = 6,
    Debug = 7,
}

impl Severity {
    fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Severity::Debug,
            "warning" => Severity::Warning,
            "error" => Severity::Error,
            _ => Severity::Info,
        }
    }
}

#[derive(Debug)]
enum Transport {
    Unix(UnixDatagram),
    Udp(UdpSocket),
    Tcp(TcpStream),
}

impl Transport {
    fn send(&mut self, message: &str) -> std::io::Result<()> {
        match self {
            Transport::Unix(socket) => socket.send(message.as_bytes()).map(|_| ()),
            Transport::Udp(socket) => socket.send(message.as_bytes()).map(|_| ()),
            Transport::Tcp(stream) => {
                stream.write_all(message.as_bytes())?;
                stream.write_all(b"\n")
            }
        }
    }
}

/// Forwards events to syslog. Severity is derived from the event: open
/// and update are informational, a close carrying an error is a warning.
/// Events below the configured minimum severity are skipped.
#[derive(Debug)]
pub struct SyslogSink {
    transport: Mutex<Transport>,
    tag: String,
    min_severity: Severity,
}

impl SyslogSink {
    /// Connect to syslog as described by the configuration.
    pub fn new(cfg: &SyslogConfig) -> LogResult<Self> {
        let transport = connect(cfg).map_err(LogError::Syslog)?;

        let tag = if cfg.tag.is_empty() {
            "packetpony".to_string()
        } else {
            cfg.tag.clone()
        };

        Ok(Self {
            transport: Mutex::new(transport),
            tag,
            min_severity: Severity::parse(&cfg.priority),
        })
    }

    fn format(&self, severity: Severity, message: &str) -> String {
        let priority = (FACILITY_DAEMON << 3) | severity as u8;
        format!(
            "<{priority}>{} {}[{}]: {message}",
            Local::now().format("%b %e %H:%M:%S"),
            self.tag,
            std::process::id()
        )
    }
}

impl EventSink for SyslogSink {
    fn log_event(&self, event: &ConnectionEvent) {
        let severity = match event.event_type {
            EventType::Close if event.error.is_some() => Severity::Warning,
            _ => Severity::Info,
        };

        if severity > self.min_severity {
            return;
        }

        let line = self.format(severity, &event.render_text());
        let mut transport = self.transport.lock().unwrap();
        if let Err(e) = transport.send(&line) {
            warn!(error = %e, "failed to write connection event to syslog");
        }
    }

    fn flush(&self) {
        if let Transport::Tcp(stream) = &mut *self.transport.lock().unwrap() {
            let _ = stream.flush();
        }
    }
}

fn connect(cfg: &SyslogConfig) -> std::io::Result<Transport> {
    match cfg.network.as_str() {
        "udp" => {
            let socket = UdpSocket::bind("0.0.0.0:0")?;
            socket.connect(&cfg.address)?;
            Ok(Transport::Udp(socket))
        }
        "tcp" => Ok(Transport::Tcp(TcpStream::connect(&cfg.address)?)),
        _ => {
            // Local socket, either the configured path or the usual ones.
            let socket = UnixDatagram::unbound()?;
            if !cfg.address.is_empty() {
                socket.connect(&cfg.address)?;
                return Ok(Transport::Unix(socket));
            }

            let mut last_err = None;
            for &path in LOCAL_SOCKETS {
                match socket.connect(path) {
                    Ok(()) => return Ok(Transport::Unix(socket)),
                    Err(e) => last_err = Some(e),
                }
            }
            Err(last_err.unwrap_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::NotFound, "no local syslog socket")
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Protocol;

    fn sample_event(event_type: EventType, error: Option<String>) -> ConnectionEvent {
        ConnectionEvent {
            timestamp: chrono::Utc::now(),
            listener_name: "dns".to_string(),
            protocol: Protocol::Udp,
            source_ip: "127.0.0.1".to_string(),
            source_port: 40000,
            target_ip: "10.0.0.53".to_string(),
            target_port: 53,
            event_type,
            bytes_sent: 10,
            bytes_received: 20,
            packets_sent: Some(1),
            packets_received: Some(1),
            duration_ms: 5,
            error,
        }
    }

    #[test]
    fn test_severity_parse() {
        assert_eq!(Severity::parse("debug"), Severity::Debug);
        assert_eq!(Severity::parse("WARNING"), Severity::Warning);
        assert_eq!(Severity::parse("error"), Severity::Error);
        assert_eq!(Severity::parse(""), Severity::Info);
        assert_eq!(Severity::parse("bogus"), Severity::Info);
    }

    #[test]
    fn test_events_over_unix_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("syslog.sock");
        let receiver = UnixDatagram::bind(&path).unwrap();

        let cfg = SyslogConfig {
            enabled: true,
            network: "unix".to_string(),
            address: path.to_str().unwrap().to_string(),
            tag: "ponytest".to_string(),
            priority: String::new(),
        };
        let sink = SyslogSink::new(&cfg).unwrap();

        sink.log_event(&sample_event(EventType::Open, None));

        let mut buf = [0u8; 1024];
        let n = receiver.recv(&mut buf).unwrap();
        let message = std::str::from_utf8(&buf[..n]).unwrap();

        // daemon.info = 3*8 + 6
        assert!(message.starts_with("<30>"), "got: {message}");
        assert!(message.contains("ponytest["));
        assert!(message.contains("listener=dns"));
        assert!(message.contains("event=open"));
    }

    #[test]
    fn test_close_with_error_is_warning() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("syslog.sock");
        let receiver = UnixDatagram::bind(&path).unwrap();

        let cfg = SyslogConfig {
            enabled: true,
            network: "unix".to_string(),
            address: path.to_str().unwrap().to_string(),
            tag: String::new(),
            priority: String::new(),
        };
        let sink = SyslogSink::new(&cfg).unwrap();

        sink.log_event(&sample_event(
            EventType::Close,
            Some("target unreachable".to_string()),
        ));

        let mut buf = [0u8; 1024];
        let n = receiver.recv(&mut buf).unwrap();
        let message = std::str::from_utf8(&buf[..n]).unwrap();

        // daemon.warning = 3*8 + 4
        assert!(message.starts_with("<28>"), "got: {message}");
        assert!(message.contains("error=\"target unreachable\""));
    }

    #[test]
    fn test_min_severity_filters_info_events() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("syslog.sock");
        let receiver = UnixDatagram::bind(&path).unwrap();
        receiver.set_nonblocking(true).unwrap();

        let cfg = SyslogConfig {
            enabled: true,
            network: "unix".to_string(),
            address: path.to_str().unwrap().to_string(),
            tag: String::new(),
            priority: "warning".to_string(),
        };
        let sink = SyslogSink::new(&cfg).unwrap();

        sink.log_event(&sample_event(EventType::Open, None));
        let mut buf = [0u8; 1024];
        assert!(receiver.recv(&mut buf).is_err());

        sink.log_event(&sample_event(EventType::Close, Some("boom".to_string())));
        assert!(receiver.recv(&mut buf).is_ok());
    }

    #[test]
    fn test_connect_failure() {
        let cfg = SyslogConfig {
            enabled: true,
            network: "unix".to_string(),
            address: "/nonexistent/syslog.sock".to_string(),
            tag: String::new(),
            priority: String::new(),
        };
        assert!(matches!(SyslogSink::new(&cfg), Err(LogError::Syslog(_))));
    }
}
