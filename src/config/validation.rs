//! Semantic validation of a parsed configuration.
//!
//! Shape errors (unknown actions, malformed durations and bandwidth strings,
//! negative numbers) are already rejected by the typed deserialisation in
//! [`super::types`]; this pass checks the rules that span fields.

use std::collections::HashSet;

use crate::acl;

use super::error::{ConfigError, ConfigResult};
use super::types::{
    Config, LimitAction, ListenerConfig, LoggingConfig, MetricsConfig, Protocol, RateLimitConfig,
    SyslogConfig, UdpConfig, split_host_port,
};

/// Largest permitted UDP datagram buffer.
pub const MAX_UDP_BUFFER_SIZE: usize = 65536;

impl Config {
    /// Validate the whole configuration.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.server.name.trim().is_empty() {
            return Err(ConfigError::Invalid("server.name is required".to_string()));
        }

        self.logging.validate()?;
        self.metrics.validate()?;

        if self.listeners.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one listener is required".to_string(),
            ));
        }

        let mut names = HashSet::new();
        let mut addrs = HashSet::new();

        for (index, listener) in self.listeners.iter().enumerate() {
            listener.validate().map_err(|e| {
                ConfigError::Invalid(format!("listener[{index}] ({}): {e}", listener.name))
            })?;

            if !names.insert(listener.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate listener name: {}",
                    listener.name
                )));
            }
            if !addrs.insert(listener.listen_address.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate listen address: {}",
                    listener.listen_address
                )));
            }
        }

        Ok(())
    }
}

impl LoggingConfig {
    fn validate(&self) -> ConfigResult<()> {
        if self.syslog.enabled {
            self.syslog
                .validate()
                .map_err(|e| ConfigError::Invalid(format!("syslog: {e}")))?;
        }

        if self.jsonlog.enabled && self.jsonlog.path.is_empty() {
            return Err(ConfigError::Invalid(
                "jsonlog: path is required when JSON logging is enabled".to_string(),
            ));
        }

        if !self.any_enabled() {
            return Err(ConfigError::Invalid(
                "at least one logging sink must be enabled".to_string(),
            ));
        }

        Ok(())
    }
}

impl SyslogConfig {
    fn validate(&self) -> ConfigResult<()> {
        match self.network.as_str() {
            "" | "unix" => {}
            "udp" | "tcp" => {
                if self.address.is_empty() {
                    return Err(ConfigError::Invalid(format!(
                        "address is required for network {:?}",
                        self.network
                    )));
                }
            }
            other => {
                return Err(ConfigError::Invalid(format!(
                    "invalid network type {other:?} (must be udp, tcp, or unix)"
                )))
            }
        }

        match self.priority.to_ascii_lowercase().as_str() {
            "" | "debug" | "info" | "warning" | "error" => Ok(()),
            other => Err(ConfigError::Invalid(format!(
                "invalid priority {other:?} (must be debug, info, warning, or error)"
            ))),
        }
    }
}

impl MetricsConfig {
    fn validate(&self) -> ConfigResult<()> {
        if !self.prometheus.enabled {
            return Ok(());
        }

        if self.prometheus.listen_address.is_empty() {
            return Err(ConfigError::Invalid(
                "prometheus: listen_address is required".to_string(),
            ));
        }
        if self.prometheus.path.is_empty() {
            return Err(ConfigError::Invalid(
                "prometheus: path is required".to_string(),
            ));
        }
        if !self.prometheus.path.starts_with('/') {
            return Err(ConfigError::Invalid(
                "prometheus: path must start with /".to_string(),
            ));
        }

        Ok(())
    }
}

impl ListenerConfig {
    fn validate(&self) -> ConfigResult<()> {
        if self.name.is_empty() {
            return Err(ConfigError::Invalid("name is required".to_string()));
        }

        validate_address(&self.listen_address)
            .map_err(|e| ConfigError::Invalid(format!("invalid listen_address: {e}")))?;
        validate_address(&self.target_address)
            .map_err(|e| ConfigError::Invalid(format!("invalid target_address: {e}")))?;

        for (index, entry) in self.allowlist.iter().enumerate() {
            acl::parse_rule(entry)
                .map_err(|e| ConfigError::Invalid(format!("allowlist[{index}]: {e}")))?;
        }

        self.rate_limits
            .validate()
            .map_err(|e| ConfigError::Invalid(format!("rate_limits: {e}")))?;

        if self.protocol == Protocol::Udp {
            self.udp_options()
                .validate()
                .map_err(|e| ConfigError::Invalid(format!("udp config: {e}")))?;
        }

        Ok(())
    }
}

impl RateLimitConfig {
    fn validate(&self) -> ConfigResult<()> {
        if self.action() == LimitAction::Throttle && self.throttle_minimum.is_zero() {
            return Err(ConfigError::Invalid(
                "throttle_minimum is required when action is 'throttle'".to_string(),
            ));
        }
        Ok(())
    }
}

impl UdpConfig {
    fn validate(&self) -> ConfigResult<()> {
        if self.session_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "session_timeout must be positive".to_string(),
            ));
        }
        if self.buffer_size == 0 {
            return Err(ConfigError::Invalid(
                "buffer_size must be positive".to_string(),
            ));
        }
        if self.buffer_size > MAX_UDP_BUFFER_SIZE {
            return Err(ConfigError::Invalid(format!(
                "buffer_size must not exceed {MAX_UDP_BUFFER_SIZE} bytes"
            )));
        }
        Ok(())
    }
}

/// Validate a `host:port` address. The host may be an IP, a hostname, or
/// empty (bind-all).
fn validate_address(addr: &str) -> ConfigResult<()> {
    match split_host_port(addr) {
        Some(_) => Ok(()),
        None => Err(ConfigError::Invalid(format!(
            "expected host:port, got {addr:?}"
        ))),
    }
}
