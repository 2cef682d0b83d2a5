//! UDP forwarding pipeline with virtual sessions.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::acl::Allowlist;
use crate::config::{LimitAction, ListenerConfig, Protocol, UdpConfig, split_host_port};
use crate::logging::{ConnectionEvent, EventType, MultiLogger};
use crate::metrics::{ConnectionStatus, Direction, DropReason, ProxyMetrics};
use crate::ratelimit::RateLimitManager;
use crate::session::{SessionTable, UdpSession};

/// Handles datagrams for one UDP listener: admission, session management,
/// forwarding in both directions, lifecycle telemetry.
#[derive(Debug)]
pub struct UdpProxy {
    config: Arc<ListenerConfig>,
    options: UdpConfig,
    logger: Arc<MultiLogger>,
    limiter: Arc<RateLimitManager>,
    allowlist: Allowlist,
    sessions: Arc<SessionTable>,
    metrics: Arc<ProxyMetrics>,
    target_host: String,
    target_port: u16,
}

impl UdpProxy {
    /// Create the pipeline for a listener.
    #[must_use]
    pub fn new(
        config: Arc<ListenerConfig>,
        logger: Arc<MultiLogger>,
        limiter: Arc<RateLimitManager>,
        allowlist: Allowlist,
        sessions: Arc<SessionTable>,
        metrics: Arc<ProxyMetrics>,
    ) -> Self {
        let options = config.udp_options();
        let (target_host, target_port) =
            split_host_port(&config.target_address).map_or((String::new(), 0), |(host, port)| {
                (host.to_string(), port)
            });

        Self {
            config,
            options,
            logger,
            limiter,
            allowlist,
            sessions,
            metrics,
            target_host,
            target_port,
        }
    }

    /// Datagram buffer size for this listener.
    #[must_use]
    pub fn buffer_size(&self) -> usize {
        self.options.buffer_size
    }

    /// The session table backing this listener.
    #[must_use]
    pub fn sessions(&self) -> &Arc<SessionTable> {
        &self.sessions
    }

    /// Process one datagram received on the listener socket. A new
    /// session's upstream reader is spawned onto `readers`.
    pub async fn handle_packet(
        self: Arc<Self>,
        data: Vec<u8>,
        src_addr: SocketAddr,
        listener_socket: &Arc<UdpSocket>,
        readers: &mut JoinSet<()>,
    ) {
        let name = self.config.name.as_str();
        let client_ip = src_addr.ip();

        if !self.allowlist.is_allowed(client_ip) {
            self.metrics.inc_acl_drop(name);
            self.metrics
                .record_connection(name, Protocol::Udp, ConnectionStatus::AclDenied);
            return;
        }

        let (session, is_new) = match self
            .sessions
            .get_or_create(src_addr, &self.config.target_address)
            .await
        {
            Ok(result) => result,
            Err(e) => {
                error!(listener = name, client_ip = %client_ip, error = %e, "failed to create UDP session");
                self.metrics.inc_error(name, "session_create");
                return;
            }
        };

        if is_new {
            // Admission runs after the dial so that creation failures are
            // already accounted; a reject removes the fresh session again.
            if !self.limiter.allow_connection(client_ip) {
                info!(listener = name, client_ip = %client_ip, "UDP session denied by rate limit");
                self.metrics
                    .inc_rate_limit_drop(name, DropReason::ConnectionLimit);
                self.metrics
                    .record_connection(name, Protocol::Udp, ConnectionStatus::RateLimited);
                let _ = self.sessions.remove(session.id()).await;
                return;
            }

            if self.options.logging.log_session_start {
                self.logger
                    .log_event(&self.session_event(EventType::Open, &session, Duration::ZERO));
            }

            self.metrics
                .record_connection(name, Protocol::Udp, ConnectionStatus::Accepted);
            self.metrics.inc_active(name, Protocol::Udp);

            let proxy = Arc::clone(&self);
            let reader_session = Arc::clone(&session);
            let reader_socket = Arc::clone(listener_socket);
            readers.spawn(async move {
                proxy.session_reader(reader_session, reader_socket).await;
            });
        }

        let allowed = self.limiter.allow_bandwidth(client_ip, data.len() as u64);
        self.log_bandwidth_violation(client_ip, data.len(), allowed, "");
        if !allowed {
            self.metrics
                .inc_rate_limit_drop(name, DropReason::BandwidthLimit);
            return;
        }

        match session.upstream().send(&data).await {
            Ok(n) => {
                session.record_sent(n as u64);
                self.metrics.add_bytes(name, Direction::Sent, n as u64);
                self.metrics.inc_packets(name, Direction::Sent);
            }
            Err(e) => {
                error!(listener = name, session = session.id(), error = %e, "failed to write to target");
                self.metrics.inc_error(name, "target_write");
                self.cleanup_session(&session).await;
            }
        }
    }

    /// Read responses from the upstream socket and relay them to the
    /// client until the session is cancelled, expires, or fails.
    async fn session_reader(self: Arc<Self>, session: Arc<UdpSession>, listener_socket: Arc<UdpSocket>) {
        let name = self.config.name.as_str();
        let session_timeout = self.options.session_timeout;
        let mut buf = vec![0u8; self.options.buffer_size];
        let mut cancelled = session.cancelled();

        loop {
            if session.is_cancelled() {
                break;
            }

            let received = tokio::select! {
                _ = cancelled.changed() => break,
                result = timeout(session_timeout, session.upstream().recv(&mut buf)) => result,
            };

            let n = match received {
                // Idle expiry.
                Err(_) => break,
                Ok(Err(e)) => {
                    if !session.is_cancelled() {
                        error!(listener = name, session = session.id(), error = %e, "failed to read from target");
                        self.metrics.inc_error(name, "target_read");
                    }
                    break;
                }
                Ok(Ok(n)) => n,
            };

            if n == 0 {
                continue;
            }

            let client_ip = session.source().ip();
            let allowed = self.limiter.allow_bandwidth(client_ip, n as u64);
            self.log_bandwidth_violation(client_ip, n, allowed, " on return traffic");
            if !allowed {
                self.metrics
                    .inc_rate_limit_drop(name, DropReason::BandwidthLimit);
                break;
            }

            match listener_socket.send_to(&buf[..n], session.source()).await {
                Ok(sent) => {
                    session.record_received(sent as u64);
                    self.metrics.add_bytes(name, Direction::Received, sent as u64);
                    self.metrics.inc_packets(name, Direction::Received);

                    let logging = &self.options.logging;
                    if session.should_log_periodic(
                        logging.periodic_log_interval,
                        logging.periodic_log_bytes.bytes(),
                    ) {
                        self.logger.log_event(&self.session_event(
                            EventType::Update,
                            &session,
                            session.created_at().elapsed(),
                        ));
                        session.update_periodic_log();
                    }
                }
                Err(e) => {
                    error!(listener = name, session = session.id(), error = %e, "failed to write to client");
                    self.metrics.inc_error(name, "client_write");
                    break;
                }
            }
        }

        self.cleanup_session(&session).await;
    }

    /// Tear a session down exactly once: remove it from the table, release
    /// admission quotas, emit the close event when enabled and thresholds
    /// are met, and record the duration. A second caller observes the
    /// removal already done and returns.
    pub async fn cleanup_session(&self, session: &UdpSession) {
        let Some(removed) = self.sessions.remove(session.id()).await else {
            return;
        };

        let name = self.config.name.as_str();
        let client_ip = removed.source().ip();

        self.limiter.release_connection(client_ip);
        self.limiter.release_total();

        let stats = removed.stats();
        let duration = removed.created_at().elapsed();

        let logging = &self.options.logging;
        let mut should_log = logging.log_session_close;
        if should_log {
            let min_bytes = logging.min_log_bytes.bytes();
            if min_bytes > 0 && stats.total_bytes() < min_bytes {
                should_log = false;
            }
            if !logging.min_log_duration.is_zero() && duration < logging.min_log_duration {
                should_log = false;
            }
        }

        if should_log {
            self.logger
                .log_event(&self.session_event(EventType::Close, &removed, duration));
        }

        debug!(listener = name, session = removed.id(), "UDP session closed");
        self.metrics.dec_active(name, Protocol::Udp);
        self.metrics
            .observe_duration(name, Protocol::Udp, duration.as_secs_f64());
    }

    /// Remove sessions idle for longer than the session timeout. Driven
    /// by the listener's janitor task.
    pub async fn expire_idle_sessions(&self) {
        for session in self.sessions.expired().await {
            debug!(
                listener = %self.config.name,
                session = session.id(),
                "expiring idle UDP session"
            );
            self.cleanup_session(&session).await;
        }
    }

    fn log_bandwidth_violation(
        &self,
        client_ip: std::net::IpAddr,
        bytes: usize,
        allowed: bool,
        direction_note: &str,
    ) {
        if !self.limiter.is_bandwidth_over_limit(client_ip, bytes as u64) {
            return;
        }

        let action = self.limiter.action();
        if action == LimitAction::LogOnly {
            warn!(
                listener = %self.config.name,
                client_ip = %client_ip,
                bytes,
                "bandwidth limit exceeded{direction_note} (log_only mode)"
            );
        } else if !allowed {
            info!(
                listener = %self.config.name,
                client_ip = %client_ip,
                bytes,
                action = %action,
                "packet dropped: bandwidth limit exceeded{direction_note}"
            );
        }
    }

    fn session_event(
        &self,
        event_type: EventType,
        session: &UdpSession,
        duration: Duration,
    ) -> ConnectionEvent {
        let stats = session.stats();
        let with_counters = !matches!(event_type, EventType::Open);

        ConnectionEvent {
            timestamp: chrono::Utc::now(),
            listener_name: self.config.name.clone(),
            protocol: Protocol::Udp,
            source_ip: session.source().ip().to_string(),
            source_port: session.source().port(),
            target_ip: self.target_host.clone(),
            target_port: self.target_port,
            event_type,
            bytes_sent: stats.bytes_sent,
            bytes_received: stats.bytes_received,
            packets_sent: with_counters.then_some(stats.packets_sent),
            packets_received: with_counters.then_some(stats.packets_received),
            duration_ms: duration.as_millis() as u64,
            error: None,
        }
    }
}
