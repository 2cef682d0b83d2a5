//! Composed admission control for a listener.

use std::net::IpAddr;
use std::sync::atomic::{AtomicI64, Ordering};

use crate::config::{LimitAction, RateLimitConfig};

use super::attempt::AttemptLimiter;
use super::bandwidth::BandwidthLimiter;
use super::connection::ConnectionLimiter;

/// Composes the attempt, connection, and bandwidth limiters with a
/// listener-wide total-connection cap behind a single admission check.
///
/// Each limiter is only constructed when both its maximum and its window
/// are positive; a disabled limiter always allows.
#[derive(Debug)]
pub struct RateLimitManager {
    connections: Option<ConnectionLimiter>,
    attempts: Option<AttemptLimiter>,
    bandwidth: Option<BandwidthLimiter>,
    total: AtomicI64,
    max_total: i64,
    action: LimitAction,
}

impl RateLimitManager {
    /// Build the manager from a listener's rate-limit configuration.
    #[must_use]
    pub fn new(cfg: &RateLimitConfig) -> Self {
        let connections = (cfg.max_connections_per_ip > 0 && !cfg.connections_window.is_zero())
            .then(|| {
                ConnectionLimiter::new(
                    cfg.max_connections_per_ip as usize,
                    cfg.connections_window,
                )
            });

        let attempts = (cfg.max_connection_attempts_per_ip > 0 && !cfg.attempts_window.is_zero())
            .then(|| {
                AttemptLimiter::new(
                    cfg.max_connection_attempts_per_ip as usize,
                    cfg.attempts_window,
                )
            });

        let bandwidth = (!cfg.max_bandwidth_per_ip.is_zero() && !cfg.bandwidth_window.is_zero())
            .then(|| {
                BandwidthLimiter::new(
                    cfg.max_bandwidth_per_ip.bytes(),
                    cfg.bandwidth_window,
                    cfg.action(),
                    cfg.throttle_minimum.bytes(),
                )
            });

        Self {
            connections,
            attempts,
            bandwidth,
            total: AtomicI64::new(0),
            max_total: i64::from(cfg.max_total_connections),
            action: cfg.action(),
        }
    }

    /// Admit a new connection or session from `ip`.
    ///
    /// Checks run in a fixed order: the attempt limiter first (so rejected
    /// sources keep burning quota), then the listener-wide total cap, then
    /// the per-IP connection limit, rolling back the total increment when
    /// the per-IP check fails. A `true` return must be paired with exactly
    /// one [`release_connection`](Self::release_connection) and one
    /// [`release_total`](Self::release_total).
    pub fn allow_connection(&self, ip: IpAddr) -> bool {
        if let Some(attempts) = &self.attempts {
            if !attempts.record_attempt(ip) {
                return false;
            }
        }

        if !self.allow_total() {
            return false;
        }

        if let Some(connections) = &self.connections {
            if !connections.allow(ip) {
                self.release_total();
                return false;
            }
        }

        true
    }

    /// Account `bytes` for `ip` against the bandwidth limit.
    pub fn allow_bandwidth(&self, ip: IpAddr, bytes: u64) -> bool {
        match &self.bandwidth {
            Some(bandwidth) => bandwidth.allow(ip, bytes),
            None => true,
        }
    }

    /// Whether accounting `bytes` would exceed the bandwidth ceiling,
    /// without mutating state.
    #[must_use]
    pub fn is_bandwidth_over_limit(&self, ip: IpAddr, bytes: u64) -> bool {
        match &self.bandwidth {
            Some(bandwidth) => bandwidth.is_over_limit(ip, bytes),
            None => false,
        }
    }

    /// The configured enforcement mode, defaulting to drop.
    #[must_use]
    pub fn action(&self) -> LimitAction {
        self.action
    }

    /// Check and claim a slot against the listener-wide cap.
    fn allow_total(&self) -> bool {
        if self.max_total == 0 {
            return true;
        }

        let current = self.total.fetch_add(1, Ordering::SeqCst) + 1;
        if current > self.max_total {
            self.total.fetch_sub(1, Ordering::SeqCst);
            return false;
        }
        true
    }

    /// Release one per-IP admission.
    pub fn release_connection(&self, ip: IpAddr) {
        if let Some(connections) = &self.connections {
            connections.release(ip);
        }
    }

    /// Release one slot of the listener-wide cap.
    pub fn release_total(&self) {
        if self.max_total > 0 {
            self.total.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Current listener-wide connection count.
    #[must_use]
    pub fn total_connections(&self) -> i64 {
        self.total.load(Ordering::SeqCst)
    }

    /// Stop all background reclamation tasks.
    pub fn close(&self) {
        if let Some(connections) = &self.connections {
            connections.close();
        }
        if let Some(attempts) = &self.attempts {
            attempts.close();
        }
        if let Some(bandwidth) = &self.bandwidth {
            bandwidth.close();
        }
    }
}
