//! Prometheus metrics for the forwarding pipelines.
//!
//! Label sets are part of the external contract: dashboards key on
//! `listener`, `protocol`, `status`, `direction`, `reason`, and `type`.

mod server;

pub use server::{MetricsError, MetricsResult, MetricsServer};

use prometheus_client::encoding::{EncodeLabel, EncodeLabelSet, LabelSetEncoder};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

use crate::config::Protocol;

/// Outcome of an admission decision, as a metric label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Accepted,
    AclDenied,
    RateLimited,
}

impl ConnectionStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            ConnectionStatus::Accepted => "accepted",
            ConnectionStatus::AclDenied => "acl_denied",
            ConnectionStatus::RateLimited => "rate_limited",
        }
    }
}

/// Transfer direction, as a metric label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Sent,
    Received,
}

impl Direction {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Direction::Sent => "sent",
            Direction::Received => "received",
        }
    }
}

/// Which limit caused a rate-limit drop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    ConnectionLimit,
    BandwidthLimit,
}

impl DropReason {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            DropReason::ConnectionLimit => "connection_limit",
            DropReason::BandwidthLimit => "bandwidth_limit",
        }
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ConnectionLabels {
    listener: String,
    protocol: &'static str,
    status: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ActiveLabels {
    listener: String,
    protocol: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct DirectionLabels {
    listener: String,
    direction: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ReasonLabels {
    listener: String,
    reason: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ListenerLabels {
    listener: String,
}

/// Labels for the error counter. `type` is a reserved word, so the label
/// set is encoded by hand.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
struct ErrorLabels {
    listener: String,
    kind: &'static str,
}

impl EncodeLabelSet for ErrorLabels {
    fn encode(&self, mut encoder: LabelSetEncoder) -> Result<(), std::fmt::Error> {
        ("listener", self.listener.as_str()).encode(encoder.encode_label())?;
        ("type", self.kind).encode(encoder.encode_label())?;
        Ok(())
    }
}

fn duration_histogram() -> Histogram {
    // 1ms to ~16s.
    Histogram::new(exponential_buckets(0.001, 2.0, 15))
}

/// All proxy metrics, backed by one registry.
///
/// Counters, gauges, and histograms are lock-free on the hot path; the
/// pipelines never serialize on this type.
#[derive(Debug)]
pub struct ProxyMetrics {
    registry: Registry,
    connections_total: Family<ConnectionLabels, Counter>,
    connections_active: Family<ActiveLabels, Gauge>,
    bytes_transferred: Family<DirectionLabels, Counter>,
    packets_transferred: Family<DirectionLabels, Counter>,
    connection_duration: Family<ActiveLabels, Histogram, fn() -> Histogram>,
    rate_limit_drops: Family<ReasonLabels, Counter>,
    acl_drops: Family<ListenerLabels, Counter>,
    errors: Family<ErrorLabels, Counter>,
}

impl Default for ProxyMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ProxyMetrics {
    /// Create and register every metric family.
    #[must_use]
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let connections_total = Family::<ConnectionLabels, Counter>::default();
        registry.register(
            "packetpony_connections",
            "Total number of connections",
            connections_total.clone(),
        );

        let connections_active = Family::<ActiveLabels, Gauge>::default();
        registry.register(
            "packetpony_connections_active",
            "Number of active connections",
            connections_active.clone(),
        );

        let bytes_transferred = Family::<DirectionLabels, Counter>::default();
        registry.register(
            "packetpony_bytes_transferred",
            "Total bytes transferred",
            bytes_transferred.clone(),
        );

        let packets_transferred = Family::<DirectionLabels, Counter>::default();
        registry.register(
            "packetpony_packets_transferred",
            "Total packets transferred (UDP only)",
            packets_transferred.clone(),
        );

        let connection_duration =
            Family::<ActiveLabels, Histogram, fn() -> Histogram>::new_with_constructor(
                duration_histogram,
            );
        registry.register(
            "packetpony_connection_duration_seconds",
            "Connection duration in seconds",
            connection_duration.clone(),
        );

        let rate_limit_drops = Family::<ReasonLabels, Counter>::default();
        registry.register(
            "packetpony_rate_limit_drops",
            "Total connections dropped due to rate limiting",
            rate_limit_drops.clone(),
        );

        let acl_drops = Family::<ListenerLabels, Counter>::default();
        registry.register(
            "packetpony_acl_drops",
            "Total connections dropped due to ACL",
            acl_drops.clone(),
        );

        let errors = Family::<ErrorLabels, Counter>::default();
        registry.register(
            "packetpony_errors",
            "Total errors encountered",
            errors.clone(),
        );

        Self {
            registry,
            connections_total,
            connections_active,
            bytes_transferred,
            packets_transferred,
            connection_duration,
            rate_limit_drops,
            acl_drops,
            errors,
        }
    }

    /// Count a connection admission outcome.
    pub fn record_connection(&self, listener: &str, protocol: Protocol, status: ConnectionStatus) {
        self.connections_total
            .get_or_create(&ConnectionLabels {
                listener: listener.to_string(),
                protocol: protocol.as_str(),
                status: status.as_str(),
            })
            .inc();
    }

    /// Increment the active-connections gauge.
    pub fn inc_active(&self, listener: &str, protocol: Protocol) {
        self.connections_active
            .get_or_create(&ActiveLabels {
                listener: listener.to_string(),
                protocol: protocol.as_str(),
            })
            .inc();
    }

    /// Decrement the active-connections gauge.
    pub fn dec_active(&self, listener: &str, protocol: Protocol) {
        self.connections_active
            .get_or_create(&ActiveLabels {
                listener: listener.to_string(),
                protocol: protocol.as_str(),
            })
            .dec();
    }

    /// Current active-connections gauge value.
    #[must_use]
    pub fn active(&self, listener: &str, protocol: Protocol) -> i64 {
        self.connections_active
            .get_or_create(&ActiveLabels {
                listener: listener.to_string(),
                protocol: protocol.as_str(),
            })
            .get()
    }

    /// Add transferred bytes.
    pub fn add_bytes(&self, listener: &str, direction: Direction, bytes: u64) {
        self.bytes_transferred
            .get_or_create(&DirectionLabels {
                listener: listener.to_string(),
                direction: direction.as_str(),
            })
            .inc_by(bytes);
    }

    /// Count one transferred packet.
    pub fn inc_packets(&self, listener: &str, direction: Direction) {
        self.packets_transferred
            .get_or_create(&DirectionLabels {
                listener: listener.to_string(),
                direction: direction.as_str(),
            })
            .inc();
    }

    /// Record a connection duration.
    pub fn observe_duration(&self, listener: &str, protocol: Protocol, seconds: f64) {
        self.connection_duration
            .get_or_create(&ActiveLabels {
                listener: listener.to_string(),
                protocol: protocol.as_str(),
            })
            .observe(seconds);
    }

    /// Count a rate-limit drop.
    pub fn inc_rate_limit_drop(&self, listener: &str, reason: DropReason) {
        self.rate_limit_drops
            .get_or_create(&ReasonLabels {
                listener: listener.to_string(),
                reason: reason.as_str(),
            })
            .inc();
    }

    /// Count an ACL drop.
    pub fn inc_acl_drop(&self, listener: &str) {
        self.acl_drops
            .get_or_create(&ListenerLabels {
                listener: listener.to_string(),
            })
            .inc();
    }

    /// Count an error of the given type.
    pub fn inc_error(&self, listener: &str, kind: &'static str) {
        self.errors
            .get_or_create(&ErrorLabels {
                listener: listener.to_string(),
                kind,
            })
            .inc();
    }

    /// Encode every metric in OpenMetrics text format.
    #[must_use]
    pub fn encode(&self) -> String {
        let mut out = String::new();
        if prometheus_client::encoding::text::encode(&mut out, &self.registry).is_err() {
            out.clear();
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_counters() {
        let metrics = ProxyMetrics::new();
        metrics.record_connection("web", Protocol::Tcp, ConnectionStatus::Accepted);
        metrics.record_connection("web", Protocol::Tcp, ConnectionStatus::Accepted);
        metrics.record_connection("web", Protocol::Tcp, ConnectionStatus::RateLimited);

        let out = metrics.encode();
        assert!(out.contains(
            "packetpony_connections_total{listener=\"web\",protocol=\"tcp\",status=\"accepted\"} 2"
        ));
        assert!(out.contains("status=\"rate_limited\"} 1"));
    }

    #[test]
    fn test_active_gauge() {
        let metrics = ProxyMetrics::new();
        metrics.inc_active("web", Protocol::Tcp);
        metrics.inc_active("web", Protocol::Tcp);
        metrics.dec_active("web", Protocol::Tcp);
        assert_eq!(metrics.active("web", Protocol::Tcp), 1);

        let out = metrics.encode();
        assert!(out.contains(
            "packetpony_connections_active{listener=\"web\",protocol=\"tcp\"} 1"
        ));
    }

    #[test]
    fn test_bytes_and_packets() {
        let metrics = ProxyMetrics::new();
        metrics.add_bytes("dns", Direction::Sent, 100);
        metrics.add_bytes("dns", Direction::Sent, 50);
        metrics.add_bytes("dns", Direction::Received, 10);
        metrics.inc_packets("dns", Direction::Sent);

        let out = metrics.encode();
        assert!(out.contains(
            "packetpony_bytes_transferred_total{listener=\"dns\",direction=\"sent\"} 150"
        ));
        assert!(out.contains(
            "packetpony_bytes_transferred_total{listener=\"dns\",direction=\"received\"} 10"
        ));
        assert!(out.contains(
            "packetpony_packets_transferred_total{listener=\"dns\",direction=\"sent\"} 1"
        ));
    }

    #[test]
    fn test_error_label_is_named_type() {
        let metrics = ProxyMetrics::new();
        metrics.inc_error("web", "target_connect");

        let out = metrics.encode();
        assert!(out.contains(
            "packetpony_errors_total{listener=\"web\",type=\"target_connect\"} 1"
        ));
    }

    #[test]
    fn test_drop_counters() {
        let metrics = ProxyMetrics::new();
        metrics.inc_rate_limit_drop("web", DropReason::BandwidthLimit);
        metrics.inc_acl_drop("web");

        let out = metrics.encode();
        assert!(out.contains(
            "packetpony_rate_limit_drops_total{listener=\"web\",reason=\"bandwidth_limit\"} 1"
        ));
        assert!(out.contains("packetpony_acl_drops_total{listener=\"web\"} 1"));
    }

    #[test]
    fn test_duration_histogram_buckets() {
        let metrics = ProxyMetrics::new();
        metrics.observe_duration("web", Protocol::Tcp, 0.005);

        let out = metrics.encode();
        assert!(out.contains("packetpony_connection_duration_seconds_bucket"));
        assert!(out.contains("packetpony_connection_duration_seconds_count"));
    }
}
