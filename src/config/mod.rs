//! Configuration loading, types, and validation.
//!
//! The forwarder is configured by a single YAML file describing the server
//! identity, the logging sinks, the metrics endpoint, and one entry per
//! forwarding listener. Durations are human-readable (`30s`, `5m`) and byte
//! quantities carry a binary unit suffix (`512B`, `10MB`).

mod error;
mod loader;
mod types;
mod validation;

pub use error::{ConfigError, ConfigResult};
pub use loader::{load, load_str};
pub use types::{
    Bandwidth, Config, JsonLogConfig, LimitAction, ListenerConfig, LoggingConfig, MetricsConfig,
    PrometheusConfig, Protocol, RateLimitConfig, ServerConfig, StdoutConfig, SyslogConfig,
    TcpConfig, UdpConfig, UdpLoggingConfig, split_host_port,
};
pub use validation::MAX_UDP_BUFFER_SIZE;
