//! Configuration types for the forwarder.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;

use super::error::ConfigError;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server-wide settings.
    pub server: ServerConfig,

    /// Logging sink configuration.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Forwarding endpoints.
    #[serde(default)]
    pub listeners: Vec<ListenerConfig>,
}

/// Server-level settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Instance name, used in startup logs.
    pub name: String,
}

/// Logging sinks and their configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Syslog sink.
    #[serde(default)]
    pub syslog: SyslogConfig,

    /// JSON-lines file sink.
    #[serde(default)]
    pub jsonlog: JsonLogConfig,

    /// Stdout sink (journald-friendly).
    #[serde(default)]
    pub stdout: StdoutConfig,
}

impl LoggingConfig {
    /// Whether at least one sink is enabled.
    #[must_use]
    pub fn any_enabled(&self) -> bool {
        self.syslog.enabled || self.jsonlog.enabled || self.stdout.enabled
    }
}

/// Syslog sink configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyslogConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Transport: `udp`, `tcp`, `unix`, or empty for the local socket.
    #[serde(default)]
    pub network: String,

    /// Remote address for `udp`/`tcp`, socket path for `unix`.
    #[serde(default)]
    pub address: String,

    /// Syslog tag prepended to every message.
    #[serde(default)]
    pub tag: String,

    /// Severity used for informational messages: `debug`, `info`,
    /// `warning`, or `error`.
    #[serde(default)]
    pub priority: String,
}

/// JSON-lines file sink configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JsonLogConfig {
    #[serde(default)]
    pub enabled: bool,

    /// File the sink appends to.
    #[serde(default)]
    pub path: String,
}

/// Stdout sink configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StdoutConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Emit JSON records instead of the text rendering.
    #[serde(default)]
    pub use_json: bool,
}

/// Metrics configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub prometheus: PrometheusConfig,
}

/// Prometheus scrape endpoint configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PrometheusConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Address the scrape server binds to.
    #[serde(default)]
    pub listen_address: String,

    /// HTTP path serving the scrape body.
    #[serde(default)]
    pub path: String,
}

/// Transport protocol of a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    /// Lowercase wire name, as used in log events and metric labels.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Enforcement mode when a bandwidth limit is exceeded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitAction {
    /// Deny the transfer; dropped bytes do not count against quota.
    #[default]
    Drop,
    /// Allow transfers up to the throttle minimum per operation.
    Throttle,
    /// Allow everything, log each violation.
    LogOnly,
}

impl LimitAction {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            LimitAction::Drop => "drop",
            LimitAction::Throttle => "throttle",
            LimitAction::LogOnly => "log_only",
        }
    }
}

impl fmt::Display for LimitAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A byte quantity parsed from a human-readable string such as `10MB`.
///
/// Accepted units are `B`, `KB`, `MB`, `GB`, and `TB` with 1024-based
/// multipliers. The empty string parses as zero, which disables whatever
/// limit the value configures.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Bandwidth(u64);

impl Bandwidth {
    /// Wrap a raw byte count.
    #[must_use]
    pub const fn from_bytes(bytes: u64) -> Self {
        Self(bytes)
    }

    /// The quantity in bytes.
    #[must_use]
    pub const fn bytes(self) -> u64 {
        self.0
    }

    /// Whether the value is zero (limit disabled).
    #[must_use]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }
}

fn bandwidth_pattern() -> &'static regex::Regex {
    static PATTERN: OnceLock<regex::Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        regex::Regex::new(r"^(\d+(?:\.\d+)?)\s*([KMGT]?B)$").expect("bandwidth regex is valid")
    })
}

impl FromStr for Bandwidth {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Ok(Self(0));
        }

        let upper = trimmed.to_ascii_uppercase();
        let captures = bandwidth_pattern().captures(&upper).ok_or_else(|| {
            ConfigError::Invalid(format!(
                "invalid bandwidth {s:?} (expected format: 10MB, 1GB, ...)"
            ))
        })?;

        let value: f64 = captures[1]
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("invalid bandwidth value {s:?}")))?;

        let multiplier: u64 = match &captures[2] {
            "B" => 1,
            "KB" => 1024,
            "MB" => 1024 * 1024,
            "GB" => 1024 * 1024 * 1024,
            "TB" => 1024 * 1024 * 1024 * 1024,
            unit => {
                return Err(ConfigError::Invalid(format!(
                    "unknown bandwidth unit {unit:?}"
                )))
            }
        };

        Ok(Self((value * multiplier as f64) as u64))
    }
}

impl fmt::Display for Bandwidth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}B", self.0)
    }
}

impl Serialize for Bandwidth {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Bandwidth {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// A single forwarding endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    /// Unique listener name.
    pub name: String,

    /// Transport protocol.
    pub protocol: Protocol,

    /// Local address to bind.
    pub listen_address: String,

    /// Upstream address to forward to.
    pub target_address: String,

    /// CIDR prefixes (or bare IPs) permitted to connect. Empty denies all.
    #[serde(default)]
    pub allowlist: Vec<String>,

    /// Rate limiting rules.
    #[serde(default)]
    pub rate_limits: RateLimitConfig,

    /// TCP-specific options.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp: Option<TcpConfig>,

    /// UDP-specific options.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub udp: Option<UdpConfig>,
}

impl ListenerConfig {
    /// UDP options, falling back to the defaults when the block is absent.
    #[must_use]
    pub fn udp_options(&self) -> UdpConfig {
        self.udp.clone().unwrap_or_default()
    }
}

/// Sliding-window rate limits for a listener. Zero disables a limit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Maximum concurrent connections per source IP.
    #[serde(default)]
    pub max_connections_per_ip: u32,

    /// Window over which per-IP connections are counted.
    #[serde(default, with = "humantime_serde")]
    pub connections_window: Duration,

    /// Maximum connection attempts per source IP, rejects included.
    #[serde(default)]
    pub max_connection_attempts_per_ip: u32,

    /// Window over which attempts are counted.
    #[serde(default, with = "humantime_serde")]
    pub attempts_window: Duration,

    /// Maximum bytes per source IP within the bandwidth window.
    #[serde(default)]
    pub max_bandwidth_per_ip: Bandwidth,

    /// Window over which bandwidth is summed.
    #[serde(default, with = "humantime_serde")]
    pub bandwidth_window: Duration,

    /// Cap on concurrent connections across the whole listener.
    #[serde(default)]
    pub max_total_connections: u32,

    /// Enforcement mode for the bandwidth limit. Defaults to drop.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<LimitAction>,

    /// Largest per-operation size allowed through while over the ceiling
    /// under throttle mode.
    #[serde(default)]
    pub throttle_minimum: Bandwidth,
}

impl RateLimitConfig {
    /// The configured action, defaulting to drop.
    #[must_use]
    pub fn action(&self) -> LimitAction {
        self.action.unwrap_or_default()
    }
}

/// TCP-specific timeouts. Zero disables a timeout.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TcpConfig {
    #[serde(default, with = "humantime_serde")]
    pub read_timeout: Duration,

    #[serde(default, with = "humantime_serde")]
    pub write_timeout: Duration,

    /// Pushes read deadlines forward after each successful transfer.
    #[serde(default, with = "humantime_serde")]
    pub idle_timeout: Duration,
}

/// UDP-specific session options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UdpConfig {
    /// Idle time after which a session expires.
    #[serde(default = "default_session_timeout", with = "humantime_serde")]
    pub session_timeout: Duration,

    /// Datagram buffer size in bytes, at most 65536.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Session lifecycle logging.
    #[serde(default)]
    pub logging: UdpLoggingConfig,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            session_timeout: default_session_timeout(),
            buffer_size: default_buffer_size(),
            logging: UdpLoggingConfig::default(),
        }
    }
}

fn default_session_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_buffer_size() -> usize {
    4096
}

/// Controls which UDP session lifecycle events are logged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UdpLoggingConfig {
    /// Emit an open event when a session is created.
    #[serde(default = "default_true")]
    pub log_session_start: bool,

    /// Emit a close event when a session is destroyed.
    #[serde(default = "default_true")]
    pub log_session_close: bool,

    /// Emit update events at least this often for active sessions.
    #[serde(default = "default_periodic_interval", with = "humantime_serde")]
    pub periodic_log_interval: Duration,

    /// Emit update events after this much transferred volume.
    #[serde(default = "default_periodic_bytes")]
    pub periodic_log_bytes: Bandwidth,

    /// Skip the close event for sessions shorter than this.
    #[serde(default, with = "humantime_serde")]
    pub min_log_duration: Duration,

    /// Skip the close event for sessions that moved less than this.
    #[serde(default)]
    pub min_log_bytes: Bandwidth,
}

impl Default for UdpLoggingConfig {
    fn default() -> Self {
        Self {
            log_session_start: true,
            log_session_close: true,
            periodic_log_interval: default_periodic_interval(),
            periodic_log_bytes: default_periodic_bytes(),
            min_log_duration: Duration::ZERO,
            min_log_bytes: Bandwidth::default(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_periodic_interval() -> Duration {
    Duration::from_secs(300)
}

fn default_periodic_bytes() -> Bandwidth {
    Bandwidth::from_bytes(100 * 1024 * 1024)
}

/// Split a `host:port` or `[host]:port` address into its parts.
#[must_use]
pub fn split_host_port(addr: &str) -> Option<(&str, u16)> {
    if let Some(rest) = addr.strip_prefix('[') {
        let (host, tail) = rest.split_once(']')?;
        let port = tail.strip_prefix(':')?.parse().ok()?;
        return Some((host, port));
    }

    let (host, port) = addr.rsplit_once(':')?;
    // A bare IPv6 address without brackets is not a host:port pair.
    if host.contains(':') {
        return None;
    }
    Some((host, port.parse().ok()?))
}
