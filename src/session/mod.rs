//! UDP session tracking.
//!
//! A session is a virtual bidirectional association keyed by the client's
//! `ip:port`, owning one upstream socket connected to the listener's
//! target. The [`SessionTable`] holds the authoritative reference; the
//! per-session upstream reader holds a second handle and exits at its next
//! cancellation check once the session is removed.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::{watch, RwLock};
use tracing::debug;

/// Upstream dial timeout for new sessions.
const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Result alias for session operations.
pub type SessionResult<T> = Result<T, SessionError>;

/// Errors raised while creating a session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The upstream endpoint could not be dialed.
    #[error("failed to dial target {target}: {source}")]
    Dial {
        target: String,
        #[source]
        source: std::io::Error,
    },

    /// The upstream dial exceeded the dial timeout.
    #[error("timed out dialing target {target}")]
    DialTimeout { target: String },
}

/// Monotonic transfer counters of a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
}

impl SessionStats {
    /// Total volume in both directions.
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.bytes_sent + self.bytes_received
    }
}

/// Guarded session timestamps.
#[derive(Debug, Clone, Copy)]
struct Timestamps {
    last_activity: Instant,
    last_periodic_log: Instant,
    bytes_at_last_periodic_log: u64,
}

/// A single UDP session.
#[derive(Debug)]
pub struct UdpSession {
    /// Session identity: the client's `ip:port`.
    id: String,

    /// Client address packets are returned to.
    source: SocketAddr,

    /// Connected upstream socket.
    upstream: UdpSocket,

    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    packets_sent: AtomicU64,
    packets_received: AtomicU64,

    created_at: Instant,
    timestamps: Mutex<Timestamps>,

    /// Cancellation handle stopping the upstream reader.
    cancel: watch::Sender<bool>,
}

impl UdpSession {
    fn new(source: SocketAddr, upstream: UdpSocket) -> Self {
        let now = Instant::now();
        let (cancel, _) = watch::channel(false);
        Self {
            id: source.to_string(),
            source,
            upstream,
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            packets_sent: AtomicU64::new(0),
            packets_received: AtomicU64::new(0),
            created_at: now,
            timestamps: Mutex::new(Timestamps {
                last_activity: now,
                last_periodic_log: now,
                bytes_at_last_periodic_log: 0,
            }),
            cancel,
        }
    }

    /// Session identifier, unique per listener.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Client address.
    #[must_use]
    pub fn source(&self) -> SocketAddr {
        self.source
    }

    /// The connected upstream socket.
    #[must_use]
    pub fn upstream(&self) -> &UdpSocket {
        &self.upstream
    }

    /// Refresh the activity timestamp.
    pub fn touch(&self) {
        self.timestamps.lock().unwrap().last_activity = Instant::now();
    }

    /// Record a datagram forwarded to the upstream.
    pub fn record_sent(&self, bytes: u64) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    /// Record a datagram returned to the client.
    pub fn record_received(&self, bytes: u64) {
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    /// Snapshot of the transfer counters.
    #[must_use]
    pub fn stats(&self) -> SessionStats {
        SessionStats {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
        }
    }

    /// Creation time.
    #[must_use]
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Last activity time.
    #[must_use]
    pub fn last_activity(&self) -> Instant {
        self.timestamps.lock().unwrap().last_activity
    }

    /// Whether a periodic update should be logged, by elapsed time since
    /// the last one or by transferred volume since the last one. A zero
    /// threshold disables that criterion.
    #[must_use]
    pub fn should_log_periodic(&self, interval: Duration, byte_threshold: u64) -> bool {
        let guard = self.timestamps.lock().unwrap();
        let now = Instant::now();
        let total = self.stats().total_bytes();

        if !interval.is_zero() && now.duration_since(guard.last_periodic_log) >= interval {
            return true;
        }

        byte_threshold > 0 && total - guard.bytes_at_last_periodic_log >= byte_threshold
    }

    /// Reset both periodic-log watermarks after emitting an update.
    pub fn update_periodic_log(&self) {
        let mut guard = self.timestamps.lock().unwrap();
        guard.last_periodic_log = Instant::now();
        guard.bytes_at_last_periodic_log = self.stats().total_bytes();
    }

    /// Signal the upstream reader to stop.
    pub fn cancel(&self) {
        let _ = self.cancel.send(true);
    }

    /// Whether the session has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Subscribe to the cancellation signal.
    #[must_use]
    pub fn cancelled(&self) -> watch::Receiver<bool> {
        self.cancel.subscribe()
    }
}

/// Tracks the sessions of one UDP listener.
#[derive(Debug)]
pub struct SessionTable {
    sessions: RwLock<HashMap<String, Arc<UdpSession>>>,
    timeout: Duration,
}

impl SessionTable {
    /// Create a table whose sessions expire after `timeout` of inactivity.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            timeout,
        }
    }

    /// The configured idle timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Look up the session for `source`, creating it (and dialing the
    /// upstream) if absent. The boolean is true when the session is new.
    pub async fn get_or_create(
        &self,
        source: SocketAddr,
        target: &str,
    ) -> SessionResult<(Arc<UdpSession>, bool)> {
        let key = source.to_string();

        {
            let sessions = self.sessions.read().await;
            if let Some(session) = sessions.get(&key) {
                session.touch();
                return Ok((Arc::clone(session), false));
            }
        }

        let mut sessions = self.sessions.write().await;

        // Re-check under the exclusive lock; concurrent datagrams from the
        // same source must not create two sessions.
        if let Some(session) = sessions.get(&key) {
            session.touch();
            return Ok((Arc::clone(session), false));
        }

        let upstream = dial_upstream(target).await?;
        let session = Arc::new(UdpSession::new(source, upstream));
        sessions.insert(key, Arc::clone(&session));

        debug!(session = session.id(), target, "created UDP session");
        Ok((session, true))
    }

    /// Remove a session, signalling cancellation exactly once. Returns
    /// `None` when another path already removed it.
    pub async fn remove(&self, id: &str) -> Option<Arc<UdpSession>> {
        let session = self.sessions.write().await.remove(id)?;
        session.cancel();
        Some(session)
    }

    /// Cancel every session. Entries stay in the table so that each
    /// reader's cleanup pass still observes its own removal.
    pub async fn close_all(&self) {
        let sessions = self.sessions.read().await;
        for session in sessions.values() {
            session.cancel();
        }
    }

    /// Sessions idle for longer than the table timeout.
    pub async fn expired(&self) -> Vec<Arc<UdpSession>> {
        let now = Instant::now();
        let sessions = self.sessions.read().await;
        sessions
            .values()
            .filter(|session| now.duration_since(session.last_activity()) > self.timeout)
            .cloned()
            .collect()
    }

    /// Number of live sessions.
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Whether the table is empty.
    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

/// Bind an ephemeral local socket and connect it to the target.
async fn dial_upstream(target: &str) -> SessionResult<UdpSocket> {
    let dial = async {
        let mut addrs = tokio::net::lookup_host(target).await?;
        let addr = addrs.next().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses resolved")
        })?;

        let local: SocketAddr = if addr.is_ipv6() {
            "[::]:0".parse().expect("valid bind-all address")
        } else {
            "0.0.0.0:0".parse().expect("valid bind-all address")
        };

        let socket = UdpSocket::bind(local).await?;
        socket.connect(addr).await?;
        Ok::<_, std::io::Error>(socket)
    };

    match tokio::time::timeout(DIAL_TIMEOUT, dial).await {
        Ok(Ok(socket)) => Ok(socket),
        Ok(Err(source)) => Err(SessionError::Dial {
            target: target.to_string(),
            source,
        }),
        Err(_) => Err(SessionError::DialTimeout {
            target: target.to_string(),
        }),
    }
}
