//! Per-connection TCP forwarding pipeline.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::acl::Allowlist;
use crate::config::{LimitAction, ListenerConfig, Protocol, TcpConfig, split_host_port};
use crate::logging::{ConnectionEvent, EventType, MultiLogger};
use crate::metrics::{ConnectionStatus, Direction, DropReason, ProxyMetrics};
use crate::ratelimit::RateLimitManager;

/// Upstream dial timeout.
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Copy buffer per direction.
const COPY_BUFFER_SIZE: usize = 32 * 1024;

/// Result of one copy direction.
#[derive(Debug, Default)]
struct CopyOutcome {
    bytes: u64,
    error: Option<String>,
}

/// Shared transfer clock for the two copy directions.
///
/// Read deadlines start from the configured read timeout; once any
/// direction transfers data and an idle timeout is configured, both
/// directions' deadlines follow the shared last-activity instant.
#[derive(Debug)]
struct TransferActivity {
    start: Instant,
    /// Milliseconds since `start` of the last transfer; `u64::MAX` until
    /// the first one.
    last_ms: AtomicU64,
}

impl TransferActivity {
    fn new(start: Instant) -> Self {
        Self {
            start,
            last_ms: AtomicU64::new(u64::MAX),
        }
    }

    fn touch(&self) {
        let elapsed = self.start.elapsed().as_millis() as u64;
        self.last_ms.store(elapsed, Ordering::Relaxed);
    }

    fn read_deadline(&self, opts: &TcpConfig) -> Option<Instant> {
        let last = self.last_ms.load(Ordering::Relaxed);
        if !opts.idle_timeout.is_zero() && last != u64::MAX {
            Some(self.start + Duration::from_millis(last) + opts.idle_timeout)
        } else if !opts.read_timeout.is_zero() {
            Some(self.start + opts.read_timeout)
        } else {
            None
        }
    }
}

enum ReadOutcome {
    Data(std::io::Result<usize>),
    DeadlineElapsed,
}

async fn read_with_deadline<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
    deadline: Option<Instant>,
) -> ReadOutcome {
    let Some(deadline) = deadline else {
        return ReadOutcome::Data(reader.read(buf).await);
    };

    let now = Instant::now();
    if deadline <= now {
        return ReadOutcome::DeadlineElapsed;
    }

    match timeout(deadline - now, reader.read(buf)).await {
        Ok(result) => ReadOutcome::Data(result),
        Err(_) => ReadOutcome::DeadlineElapsed,
    }
}

async fn write_with_timeout<W: AsyncWrite + Unpin>(
    writer: &mut W,
    buf: &[u8],
    write_timeout: Duration,
) -> std::io::Result<()> {
    if write_timeout.is_zero() {
        return writer.write_all(buf).await;
    }

    match timeout(write_timeout, writer.write_all(buf)).await {
        Ok(result) => result,
        Err(_) => Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "write timeout",
        )),
    }
}

/// Handles accepted TCP connections for one listener: admission, upstream
/// dial, bidirectional copy with bandwidth accounting, close telemetry.
#[derive(Debug)]
pub struct TcpProxy {
    config: Arc<ListenerConfig>,
    logger: Arc<MultiLogger>,
    limiter: Arc<RateLimitManager>,
    allowlist: Allowlist,
    metrics: Arc<ProxyMetrics>,
    target_host: String,
    target_port: u16,
}

impl TcpProxy {
    /// Create the pipeline for a listener.
    #[must_use]
    pub fn new(
        config: Arc<ListenerConfig>,
        logger: Arc<MultiLogger>,
        limiter: Arc<RateLimitManager>,
        allowlist: Allowlist,
        metrics: Arc<ProxyMetrics>,
    ) -> Self {
        let (target_host, target_port) =
            split_host_port(&config.target_address).map_or((String::new(), 0), |(host, port)| {
                (host.to_string(), port)
            });

        Self {
            config,
            logger,
            limiter,
            allowlist,
            metrics,
            target_host,
            target_port,
        }
    }

    /// Run the full pipeline for one accepted connection. Consumes the
    /// client socket; both sockets are closed on return.
    pub async fn handle_connection(
        self: Arc<Self>,
        client: TcpStream,
        peer_addr: SocketAddr,
        shutdown: watch::Receiver<bool>,
    ) {
        let start = Instant::now();
        let client_ip = peer_addr.ip();
        let name = self.config.name.clone();

        if !self.allowlist.is_allowed(client_ip) {
            debug!(listener = %name, client = %peer_addr, "connection denied by ACL");
            self.metrics.inc_acl_drop(&name);
            self.metrics
                .record_connection(&name, Protocol::Tcp, ConnectionStatus::AclDenied);
            return;
        }

        if !self.limiter.allow_connection(client_ip) {
            info!(listener = %name, client_ip = %client_ip, "connection denied by rate limit");
            self.metrics
                .inc_rate_limit_drop(&name, DropReason::ConnectionLimit);
            self.metrics
                .record_connection(&name, Protocol::Tcp, ConnectionStatus::RateLimited);
            return;
        }

        self.logger
            .log_event(&self.event(EventType::Open, peer_addr, 0, 0, 0, None));
        self.metrics
            .record_connection(&name, Protocol::Tcp, ConnectionStatus::Accepted);
        self.metrics.inc_active(&name, Protocol::Tcp);

        let target = match timeout(
            DIAL_TIMEOUT,
            TcpStream::connect(&self.config.target_address),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                error!(
                    listener = %name,
                    target = %self.config.target_address,
                    error = %e,
                    "failed to connect to target"
                );
                self.metrics.inc_error(&name, "target_connect");
                self.logger.log_event(&self.event(
                    EventType::Close,
                    peer_addr,
                    0,
                    0,
                    start.elapsed().as_millis() as u64,
                    Some(e.to_string()),
                ));
                self.metrics.dec_active(&name, Protocol::Tcp);
                self.limiter.release_connection(client_ip);
                self.limiter.release_total();
                return;
            }
            Err(_) => {
                error!(
                    listener = %name,
                    target = %self.config.target_address,
                    "timed out connecting to target"
                );
                self.metrics.inc_error(&name, "target_connect");
                self.logger.log_event(&self.event(
                    EventType::Close,
                    peer_addr,
                    0,
                    0,
                    start.elapsed().as_millis() as u64,
                    Some("target connect timeout".to_string()),
                ));
                self.metrics.dec_active(&name, Protocol::Tcp);
                self.limiter.release_connection(client_ip);
                self.limiter.release_total();
                return;
            }
        };

        debug!(listener = %name, client = %peer_addr, target = %self.config.target_address, "connection established");

        let opts = self.config.tcp.clone().unwrap_or_default();
        let activity = Arc::new(TransferActivity::new(start));

        // A direction that dies with an error tears the whole connection
        // down; the other direction may be blocked on a silent peer.
        let (teardown_tx, teardown_rx) = watch::channel(false);

        let (client_read, client_write) = client.into_split();
        let (target_read, target_write) = target.into_split();

        let mut upstream = tokio::spawn(Arc::clone(&self).copy_direction(
            client_read,
            target_write,
            client_ip,
            Arc::clone(&activity),
            opts.clone(),
            shutdown.clone(),
            teardown_rx.clone(),
        ));
        let mut downstream = tokio::spawn(Arc::clone(&self).copy_direction(
            target_read,
            client_write,
            client_ip,
            Arc::clone(&activity),
            opts,
            shutdown,
            teardown_rx,
        ));

        let failed_task = || CopyOutcome {
            bytes: 0,
            error: Some("copy task failed".to_string()),
        };

        let mut sent: Option<CopyOutcome> = None;
        let mut received: Option<CopyOutcome> = None;
        while sent.is_none() || received.is_none() {
            tokio::select! {
                result = &mut upstream, if sent.is_none() => {
                    let outcome = result.unwrap_or_else(|_| failed_task());
                    if outcome.error.is_some() {
                        let _ = teardown_tx.send(true);
                    }
                    sent = Some(outcome);
                }
                result = &mut downstream, if received.is_none() => {
                    let outcome = result.unwrap_or_else(|_| failed_task());
                    if outcome.error.is_some() {
                        let _ = teardown_tx.send(true);
                    }
                    received = Some(outcome);
                }
            }
        }
        let sent = sent.expect("upstream outcome present");
        let received = received.expect("downstream outcome present");

        self.metrics.add_bytes(&name, Direction::Sent, sent.bytes);
        self.metrics
            .add_bytes(&name, Direction::Received, received.bytes);

        let duration = start.elapsed();
        let error = sent.error.or(received.error);

        self.logger.log_event(&self.event(
            EventType::Close,
            peer_addr,
            sent.bytes,
            received.bytes,
            duration.as_millis() as u64,
            error,
        ));

        self.metrics
            .observe_duration(&name, Protocol::Tcp, duration.as_secs_f64());
        self.metrics.dec_active(&name, Protocol::Tcp);
        self.limiter.release_connection(client_ip);
        self.limiter.release_total();
    }

    /// Copy one direction until EOF, an error, a bandwidth denial, or
    /// shutdown. On EOF the peer's write side is shut down so the FIN
    /// propagates.
    async fn copy_direction<R, W>(
        self: Arc<Self>,
        mut reader: R,
        mut writer: W,
        client_ip: IpAddr,
        activity: Arc<TransferActivity>,
        opts: TcpConfig,
        mut shutdown: watch::Receiver<bool>,
        mut teardown: watch::Receiver<bool>,
    ) -> CopyOutcome
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let name = self.config.name.as_str();
        let mut buf = vec![0u8; COPY_BUFFER_SIZE];
        let mut written: u64 = 0;

        loop {
            let read_result = loop {
                let deadline = activity.read_deadline(&opts);
                tokio::select! {
                    _ = shutdown.changed() => {
                        return CopyOutcome { bytes: written, error: None };
                    }
                    _ = teardown.changed() => {
                        return CopyOutcome { bytes: written, error: None };
                    }
                    outcome = read_with_deadline(&mut reader, &mut buf, deadline) => {
                        match outcome {
                            ReadOutcome::Data(result) => break result,
                            ReadOutcome::DeadlineElapsed => {
                                // The other direction may have pushed the
                                // shared deadline forward in the meantime.
                                let expired = activity
                                    .read_deadline(&opts)
                                    .map_or(true, |d| d <= Instant::now());
                                if expired {
                                    return CopyOutcome {
                                        bytes: written,
                                        error: Some("read timeout".to_string()),
                                    };
                                }
                            }
                        }
                    }
                }
            };

            let n = match read_result {
                Ok(0) => {
                    // EOF: forward the half-close and finish cleanly.
                    let _ = writer.shutdown().await;
                    break;
                }
                Ok(n) => n,
                Err(e) => {
                    return CopyOutcome {
                        bytes: written,
                        error: Some(e.to_string()),
                    };
                }
            };

            let allowed = self.limiter.allow_bandwidth(client_ip, n as u64);
            if self.limiter.is_bandwidth_over_limit(client_ip, n as u64) {
                let action = self.limiter.action();
                if action == LimitAction::LogOnly {
                    warn!(
                        listener = name,
                        client_ip = %client_ip,
                        bytes = n,
                        "bandwidth limit exceeded (log_only mode)"
                    );
                } else if !allowed {
                    info!(
                        listener = name,
                        client_ip = %client_ip,
                        bytes = n,
                        action = %action,
                        "connection dropped: bandwidth limit exceeded"
                    );
                }
            }

            if !allowed {
                self.metrics
                    .inc_rate_limit_drop(name, DropReason::BandwidthLimit);
                return CopyOutcome {
                    bytes: written,
                    error: Some("bandwidth limit exceeded".to_string()),
                };
            }

            if let Err(e) = write_with_timeout(&mut writer, &buf[..n], opts.write_timeout).await {
                return CopyOutcome {
                    bytes: written,
                    error: Some(e.to_string()),
                };
            }

            written += n as u64;
            activity.touch();
        }

        CopyOutcome {
            bytes: written,
            error: None,
        }
    }

    fn event(
        &self,
        event_type: EventType,
        peer_addr: SocketAddr,
        bytes_sent: u64,
        bytes_received: u64,
        duration_ms: u64,
        error: Option<String>,
    ) -> ConnectionEvent {
        ConnectionEvent {
            timestamp: chrono::Utc::now(),
            listener_name: self.config.name.clone(),
            protocol: Protocol::Tcp,
            source_ip: peer_addr.ip().to_string(),
            source_port: peer_addr.port(),
            target_ip: self.target_host.clone(),
            target_port: self.target_port,
            event_type,
            bytes_sent,
            bytes_received,
            packets_sent: None,
            packets_received: None,
            duration_ms,
            error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transfer_activity_deadlines() {
        let start = Instant::now();
        let activity = TransferActivity::new(start);

        // No timeouts configured: no deadline.
        assert!(activity.read_deadline(&TcpConfig::default()).is_none());

        // Read timeout applies from the start.
        let opts = TcpConfig {
            read_timeout: Duration::from_secs(5),
            ..TcpConfig::default()
        };
        assert_eq!(
            activity.read_deadline(&opts),
            Some(start + Duration::from_secs(5))
        );

        // Idle timeout only takes over after the first transfer.
        let opts = TcpConfig {
            read_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(60),
            ..TcpConfig::default()
        };
        assert_eq!(
            activity.read_deadline(&opts),
            Some(start + Duration::from_secs(5))
        );

        activity.touch();
        let deadline = activity.read_deadline(&opts).unwrap();
        assert!(deadline >= start + Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_write_with_timeout_passthrough() {
        let mut sink = Vec::new();
        write_with_timeout(&mut sink, b"hello", Duration::ZERO)
            .await
            .unwrap();
        write_with_timeout(&mut sink, b" world", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(sink, b"hello world");
    }

    #[tokio::test]
    async fn test_read_with_deadline_expiry() {
        // A socket with no incoming data: the deadline must fire.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = TcpStream::connect(addr).await.unwrap();
        let (_server, _) = listener.accept().await.unwrap();

        let mut buf = [0u8; 16];
        let deadline = Some(Instant::now() + Duration::from_millis(20));
        match read_with_deadline(&mut client, &mut buf, deadline).await {
            ReadOutcome::DeadlineElapsed => {}
            ReadOutcome::Data(_) => panic!("expected deadline to elapse"),
        }
    }
}
