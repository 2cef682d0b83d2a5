//! End-to-end forwarding tests against live sockets.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;

use packetpony::config::{
    Bandwidth, Config, JsonLogConfig, LimitAction, ListenerConfig, LoggingConfig, MetricsConfig,
    Protocol, RateLimitConfig, ServerConfig, UdpConfig, UdpLoggingConfig,
};
use packetpony::listener::{ListenerError, ListenerManager, TcpListener, UdpListener};
use packetpony::logging::MultiLogger;
use packetpony::metrics::ProxyMetrics;

struct Harness {
    logger: Arc<MultiLogger>,
    metrics: Arc<ProxyMetrics>,
    events_path: PathBuf,
    _dir: tempfile::TempDir,
}

impl Harness {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let events_path = dir.path().join("events.json");

        let logging = LoggingConfig {
            jsonlog: JsonLogConfig {
                enabled: true,
                path: events_path.to_str().unwrap().to_string(),
            },
            ..LoggingConfig::default()
        };

        Self {
            logger: Arc::new(MultiLogger::new(&logging).unwrap()),
            metrics: Arc::new(ProxyMetrics::new()),
            events_path,
            _dir: dir,
        }
    }

    fn events(&self) -> Vec<serde_json::Value> {
        let Ok(content) = std::fs::read_to_string(&self.events_path) else {
            return Vec::new();
        };
        content
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    /// Poll the event log until `predicate` matches some event.
    async fn wait_for_event<F>(&self, predicate: F) -> serde_json::Value
    where
        F: Fn(&serde_json::Value) -> bool,
    {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        loop {
            if let Some(event) = self.events().into_iter().find(|e| predicate(e)) {
                return event;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "no matching event; have: {:?}",
                self.events()
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

fn tcp_listener_config(name: &str, target: SocketAddr) -> ListenerConfig {
    ListenerConfig {
        name: name.to_string(),
        protocol: Protocol::Tcp,
        listen_address: "127.0.0.1:0".to_string(),
        target_address: target.to_string(),
        allowlist: vec!["127.0.0.1/32".to_string()],
        rate_limits: RateLimitConfig::default(),
        tcp: None,
        udp: None,
    }
}

fn udp_listener_config(name: &str, target: SocketAddr) -> ListenerConfig {
    ListenerConfig {
        name: name.to_string(),
        protocol: Protocol::Udp,
        listen_address: "127.0.0.1:0".to_string(),
        target_address: target.to_string(),
        allowlist: vec!["127.0.0.1/32".to_string()],
        rate_limits: RateLimitConfig::default(),
        tcp: None,
        udp: Some(UdpConfig {
            session_timeout: Duration::from_secs(1),
            buffer_size: 4096,
            logging: UdpLoggingConfig {
                log_session_start: true,
                log_session_close: true,
                periodic_log_interval: Duration::from_secs(300),
                periodic_log_bytes: Bandwidth::from_bytes(100 * 1024 * 1024),
                min_log_duration: Duration::ZERO,
                min_log_bytes: Bandwidth::default(),
            },
        }),
    }
}

/// TCP backend echoing everything it reads.
async fn spawn_tcp_echo() -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

/// UDP backend answering every "ping" with "pong".
async fn spawn_udp_ponger() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 4096];
        while let Ok((n, peer)) = socket.recv_from(&mut buf).await {
            if &buf[..n] == b"ping" {
                let _ = socket.send_to(b"pong", peer).await;
            }
        }
    });
    addr
}

async fn read_until_eof(stream: &mut TcpStream) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match timeout(Duration::from_secs(3), stream.read(&mut buf)).await {
            Ok(Ok(0)) | Ok(Err(_)) | Err(_) => break,
            Ok(Ok(n)) => out.extend_from_slice(&buf[..n]),
        }
    }
    out
}

#[tokio::test]
async fn test_tcp_roundtrip() {
    let backend = spawn_tcp_echo().await;
    let harness = Harness::new();

    let mut listener = TcpListener::new(
        tcp_listener_config("echo", backend),
        Arc::clone(&harness.logger),
        Arc::clone(&harness.metrics),
    )
    .unwrap();
    listener.start().await.unwrap();
    let addr = listener.bound_addr().unwrap();

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(b"hello pony").await.unwrap();

    let mut echoed = [0u8; 10];
    timeout(Duration::from_secs(3), client.read_exact(&mut echoed))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&echoed, b"hello pony");

    drop(client);
    harness
        .wait_for_event(|e| e["event_type"] == "close" && e["listener_name"] == "echo")
        .await;

    let close = harness
        .events()
        .into_iter()
        .find(|e| e["event_type"] == "close")
        .unwrap();
    assert_eq!(close["bytes_sent"], 10);
    assert_eq!(close["bytes_received"], 10);
    assert_eq!(close["protocol"], "tcp");

    listener.stop().await;
    assert_eq!(harness.metrics.active("echo", Protocol::Tcp), 0);
}

#[tokio::test]
async fn test_tcp_bandwidth_drop() {
    let backend = spawn_tcp_echo().await;
    let harness = Harness::new();

    let mut cfg = tcp_listener_config("bw", backend);
    cfg.rate_limits = RateLimitConfig {
        max_connections_per_ip: 1,
        connections_window: Duration::from_secs(60),
        max_bandwidth_per_ip: Bandwidth::from_bytes(1024),
        bandwidth_window: Duration::from_secs(60),
        action: Some(LimitAction::Drop),
        ..RateLimitConfig::default()
    };

    let mut listener = TcpListener::new(
        cfg,
        Arc::clone(&harness.logger),
        Arc::clone(&harness.metrics),
    )
    .unwrap();
    listener.start().await.unwrap();
    let addr = listener.bound_addr().unwrap();

    let mut client = TcpStream::connect(addr).await.unwrap();

    // 512 upstream plus the 512-byte echo downstream account the full
    // 1024-byte budget.
    client.write_all(&[7u8; 512]).await.unwrap();
    let mut echoed = [0u8; 512];
    timeout(Duration::from_secs(3), client.read_exact(&mut echoed))
        .await
        .unwrap()
        .unwrap();

    // One more byte trips the ceiling and tears the connection down.
    client.write_all(&[7u8; 1]).await.unwrap();
    let rest = read_until_eof(&mut client).await;
    assert!(rest.is_empty());

    let close = harness
        .wait_for_event(|e| e["event_type"] == "close" && e["listener_name"] == "bw")
        .await;
    assert!(close["bytes_sent"].as_u64().unwrap() >= 512);
    assert_eq!(close["error"], "bandwidth limit exceeded");

    let scrape = harness.metrics.encode();
    assert!(scrape.contains(
        "packetpony_rate_limit_drops_total{listener=\"bw\",reason=\"bandwidth_limit\"} 1"
    ));

    listener.stop().await;
}

#[tokio::test]
async fn test_tcp_connection_cap() {
    let backend = spawn_tcp_echo().await;
    let harness = Harness::new();

    let mut cfg = tcp_listener_config("cap", backend);
    cfg.rate_limits = RateLimitConfig {
        max_connections_per_ip: 2,
        connections_window: Duration::from_secs(60),
        ..RateLimitConfig::default()
    };

    let mut listener = TcpListener::new(
        cfg,
        Arc::clone(&harness.logger),
        Arc::clone(&harness.metrics),
    )
    .unwrap();
    listener.start().await.unwrap();
    let addr = listener.bound_addr().unwrap();

    let mut c1 = TcpStream::connect(addr).await.unwrap();
    let mut c2 = TcpStream::connect(addr).await.unwrap();

    // Prove both are admitted.
    for client in [&mut c1, &mut c2] {
        client.write_all(b"x").await.unwrap();
        let mut one = [0u8; 1];
        timeout(Duration::from_secs(3), client.read_exact(&mut one))
            .await
            .unwrap()
            .unwrap();
    }

    // The third connection is rejected outright.
    let mut c3 = TcpStream::connect(addr).await.unwrap();
    let leftover = read_until_eof(&mut c3).await;
    assert!(leftover.is_empty());

    let scrape = harness.metrics.encode();
    assert!(scrape.contains(
        "packetpony_connections_total{listener=\"cap\",protocol=\"tcp\",status=\"rate_limited\"} 1"
    ));

    // Releasing one slot admits the next connection.
    drop(c1);
    harness
        .wait_for_event(|e| e["event_type"] == "close" && e["listener_name"] == "cap")
        .await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut c4 = TcpStream::connect(addr).await.unwrap();
    c4.write_all(b"y").await.unwrap();
    let mut one = [0u8; 1];
    timeout(Duration::from_secs(3), c4.read_exact(&mut one))
        .await
        .unwrap()
        .unwrap();

    listener.stop().await;
}

#[tokio::test]
async fn test_tcp_allowlist_denial() {
    let backend = spawn_tcp_echo().await;
    let harness = Harness::new();

    let mut cfg = tcp_listener_config("acl", backend);
    cfg.allowlist = vec!["10.0.0.0/8".to_string()];

    let mut listener = TcpListener::new(
        cfg,
        Arc::clone(&harness.logger),
        Arc::clone(&harness.metrics),
    )
    .unwrap();
    listener.start().await.unwrap();
    let addr = listener.bound_addr().unwrap();

    let mut client = TcpStream::connect(addr).await.unwrap();
    let leftover = read_until_eof(&mut client).await;
    assert!(leftover.is_empty());

    tokio::time::sleep(Duration::from_millis(50)).await;
    let scrape = harness.metrics.encode();
    assert!(scrape.contains("packetpony_acl_drops_total{listener=\"acl\"} 1"));
    assert!(scrape.contains(
        "packetpony_connections_total{listener=\"acl\",protocol=\"tcp\",status=\"acl_denied\"} 1"
    ));

    // No lifecycle event is emitted for denied sources.
    assert!(harness.events().is_empty());

    listener.stop().await;
}

#[tokio::test]
async fn test_tcp_log_only_mode() {
    let backend = spawn_tcp_echo().await;
    let harness = Harness::new();

    let mut cfg = tcp_listener_config("logonly", backend);
    cfg.rate_limits = RateLimitConfig {
        max_bandwidth_per_ip: Bandwidth::from_bytes(1024),
        bandwidth_window: Duration::from_secs(60),
        action: Some(LimitAction::LogOnly),
        ..RateLimitConfig::default()
    };

    let mut listener = TcpListener::new(
        cfg,
        Arc::clone(&harness.logger),
        Arc::clone(&harness.metrics),
    )
    .unwrap();
    listener.start().await.unwrap();
    let addr = listener.bound_addr().unwrap();

    let mut client = TcpStream::connect(addr).await.unwrap();

    // Far more than the 1024-byte budget flows anyway.
    for _ in 0..4 {
        client.write_all(&[9u8; 1024]).await.unwrap();
        let mut echoed = vec![0u8; 1024];
        timeout(Duration::from_secs(3), client.read_exact(&mut echoed))
            .await
            .unwrap()
            .unwrap();
    }

    let scrape = harness.metrics.encode();
    assert!(!scrape.contains("packetpony_rate_limit_drops_total{listener=\"logonly\""));

    listener.stop().await;
}

#[tokio::test]
async fn test_udp_session_lifecycle() {
    let backend = spawn_udp_ponger().await;
    let harness = Harness::new();

    let mut listener = UdpListener::new(
        udp_listener_config("dns", backend),
        Arc::clone(&harness.logger),
        Arc::clone(&harness.metrics),
    )
    .unwrap();
    listener.start().await.unwrap();
    let addr = listener.bound_addr().unwrap();

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.connect(addr).await.unwrap();
    client.send(b"ping").await.unwrap();

    let mut buf = [0u8; 64];
    let n = timeout(Duration::from_secs(3), client.recv(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..n], b"pong");

    harness
        .wait_for_event(|e| e["event_type"] == "open" && e["listener_name"] == "dns")
        .await;

    // The session expires after ~1s idle and closes exactly once.
    let close = harness
        .wait_for_event(|e| e["event_type"] == "close" && e["listener_name"] == "dns")
        .await;
    assert_eq!(close["protocol"], "udp");
    assert_eq!(close["packets_sent"], 1);
    assert_eq!(close["packets_received"], 1);
    assert_eq!(close["bytes_sent"], 4);
    assert_eq!(close["bytes_received"], 4);

    let closes = harness
        .events()
        .into_iter()
        .filter(|e| e["event_type"] == "close")
        .count();
    assert_eq!(closes, 1);

    assert_eq!(harness.metrics.active("dns", Protocol::Udp), 0);

    listener.stop().await;
}

#[tokio::test]
async fn test_udp_allowlist_denial() {
    let backend = spawn_udp_ponger().await;
    let harness = Harness::new();

    let mut cfg = udp_listener_config("udpacl", backend);
    cfg.allowlist = vec!["10.0.0.0/8".to_string()];

    let mut listener = UdpListener::new(
        cfg,
        Arc::clone(&harness.logger),
        Arc::clone(&harness.metrics),
    )
    .unwrap();
    listener.start().await.unwrap();
    let addr = listener.bound_addr().unwrap();

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.connect(addr).await.unwrap();
    client.send(b"ping").await.unwrap();

    // The packet is silently dropped.
    let mut buf = [0u8; 64];
    assert!(timeout(Duration::from_millis(300), client.recv(&mut buf))
        .await
        .is_err());

    let scrape = harness.metrics.encode();
    assert!(scrape.contains("packetpony_acl_drops_total{listener=\"udpacl\"} 1"));
    assert!(harness.events().is_empty());

    listener.stop().await;
}

#[tokio::test]
async fn test_graceful_shutdown_with_budget() {
    let backend = spawn_tcp_echo().await;
    let harness = Harness::new();

    let cfg = Config {
        server: ServerConfig {
            name: "test".to_string(),
        },
        logging: LoggingConfig::default(),
        metrics: MetricsConfig::default(),
        listeners: vec![tcp_listener_config("long", backend)],
    };

    let mut manager = ListenerManager::new(
        &cfg,
        Arc::clone(&harness.logger),
        Arc::clone(&harness.metrics),
    )
    .unwrap();
    manager.start().await.unwrap();
    let addr = manager.listeners()[0].bound_addr().unwrap();

    // A long-lived connection trickling data.
    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(b"tick").await.unwrap();
    let mut buf = [0u8; 4];
    timeout(Duration::from_secs(3), client.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();

    manager
        .graceful_shutdown(Duration::from_secs(2))
        .await
        .unwrap();

    // The in-flight connection was drained and closed.
    harness
        .wait_for_event(|e| e["event_type"] == "close" && e["listener_name"] == "long")
        .await;
    assert_eq!(harness.metrics.active("long", Protocol::Tcp), 0);

    // Listen socket is gone.
    assert!(TcpStream::connect(addr).await.is_err() || {
        let mut probe = TcpStream::connect(addr).await.unwrap();
        read_until_eof(&mut probe).await.is_empty()
    });
}

#[tokio::test]
async fn test_graceful_shutdown_zero_budget_times_out() {
    let backend = spawn_tcp_echo().await;
    let harness = Harness::new();

    let cfg = Config {
        server: ServerConfig {
            name: "test".to_string(),
        },
        logging: LoggingConfig::default(),
        metrics: MetricsConfig::default(),
        listeners: vec![tcp_listener_config("hasty", backend)],
    };

    let mut manager = ListenerManager::new(
        &cfg,
        Arc::clone(&harness.logger),
        Arc::clone(&harness.metrics),
    )
    .unwrap();
    manager.start().await.unwrap();
    let addr = manager.listeners()[0].bound_addr().unwrap();

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(b"tick").await.unwrap();
    let mut buf = [0u8; 4];
    timeout(Duration::from_secs(3), client.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();

    let result = manager.graceful_shutdown(Duration::ZERO).await;
    assert!(matches!(result, Err(ListenerError::ShutdownTimeout(_))));
}

#[tokio::test]
async fn test_udp_throttle_mode() {
    let backend = spawn_udp_ponger().await;
    let harness = Harness::new();

    let mut cfg = udp_listener_config("throttle", backend);
    cfg.rate_limits = RateLimitConfig {
        max_bandwidth_per_ip: Bandwidth::from_bytes(8),
        bandwidth_window: Duration::from_secs(60),
        action: Some(LimitAction::Throttle),
        throttle_minimum: Bandwidth::from_bytes(4),
        ..RateLimitConfig::default()
    };

    let mut listener = UdpListener::new(
        cfg,
        Arc::clone(&harness.logger),
        Arc::clone(&harness.metrics),
    )
    .unwrap();
    listener.start().await.unwrap();
    let addr = listener.bound_addr().unwrap();

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.connect(addr).await.unwrap();

    // Exhaust the 8-byte budget.
    client.send(b"ping").await.unwrap();
    let mut buf = [0u8; 64];
    timeout(Duration::from_secs(3), client.recv(&mut buf))
        .await
        .unwrap()
        .unwrap();

    // Over the ceiling: a packet within the throttle minimum still flows.
    client.send(b"ping").await.unwrap();
    timeout(Duration::from_secs(3), client.recv(&mut buf))
        .await
        .unwrap()
        .unwrap();

    // A larger packet is dropped.
    client.send(b"ping-too-long").await.unwrap();
    assert!(timeout(Duration::from_millis(300), client.recv(&mut buf))
        .await
        .is_err());

    let scrape = harness.metrics.encode();
    assert!(scrape.contains(
        "packetpony_rate_limit_drops_total{listener=\"throttle\",reason=\"bandwidth_limit\"}"
    ));

    listener.stop().await;
}
