//! UDP listener: receive loop, session readers, and idle janitor.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{error, info};

use crate::acl::Allowlist;
use crate::config::ListenerConfig;
use crate::logging::MultiLogger;
use crate::metrics::ProxyMetrics;
use crate::proxy::UdpProxy;
use crate::ratelimit::RateLimitManager;
use crate::session::SessionTable;

use super::error::{ListenerError, ListenerResult};

/// A bound UDP endpoint, its session table, and its forwarding pipeline.
///
/// Must be created inside a tokio runtime; the rate limiter spawns its
/// reclamation tasks at construction.
#[derive(Debug)]
pub struct UdpListener {
    config: Arc<ListenerConfig>,
    proxy: Arc<UdpProxy>,
    limiter: Arc<RateLimitManager>,
    shutdown: watch::Sender<bool>,
    read_task: Option<JoinHandle<()>>,
    janitor_task: Option<JoinHandle<()>>,
    bound_addr: Option<SocketAddr>,
}

impl UdpListener {
    /// Build the listener from its configuration.
    pub fn new(
        config: ListenerConfig,
        logger: Arc<MultiLogger>,
        metrics: Arc<ProxyMetrics>,
    ) -> ListenerResult<Self> {
        let allowlist = Allowlist::new(&config.allowlist)?;
        let limiter = Arc::new(RateLimitManager::new(&config.rate_limits));
        let options = config.udp_options();
        let sessions = Arc::new(SessionTable::new(options.session_timeout));
        let config = Arc::new(config);
        let proxy = Arc::new(UdpProxy::new(
            Arc::clone(&config),
            logger,
            Arc::clone(&limiter),
            allowlist,
            sessions,
            metrics,
        ));
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            config,
            proxy,
            limiter,
            shutdown,
            read_task: None,
            janitor_task: None,
            bound_addr: None,
        })
    }

    /// Listener name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// The bound address, once started.
    #[must_use]
    pub fn bound_addr(&self) -> Option<SocketAddr> {
        self.bound_addr
    }

    /// Bind the socket and start the receive loop and the janitor.
    pub async fn start(&mut self) -> ListenerResult<()> {
        if self.read_task.is_some() {
            return Err(ListenerError::AlreadyRunning(self.config.name.clone()));
        }

        let socket = UdpSocket::bind(&self.config.listen_address)
            .await
            .map_err(|e| ListenerError::Bind {
                addr: self.config.listen_address.clone(),
                source: e,
            })?;
        let socket = Arc::new(socket);
        self.bound_addr = socket.local_addr().ok();

        info!(
            listener = %self.config.name,
            address = %self.config.listen_address,
            target = %self.config.target_address,
            "UDP listener started"
        );

        self.read_task = Some(tokio::spawn(read_loop(
            socket,
            Arc::clone(&self.proxy),
            self.shutdown.subscribe(),
        )));

        let janitor_period = self.proxy.sessions().timeout() / 2;
        self.janitor_task = Some(tokio::spawn(janitor(
            Arc::clone(&self.proxy),
            janitor_period,
            self.shutdown.subscribe(),
        )));

        Ok(())
    }

    /// Stop reading, cancel every session, and wait for the readers to
    /// finish their cleanup.
    pub async fn stop(&mut self) {
        info!(listener = %self.config.name, "stopping UDP listener");
        let _ = self.shutdown.send(true);
        self.limiter.close();

        if let Some(task) = self.read_task.take() {
            let _ = task.await;
        }
        if let Some(task) = self.janitor_task.take() {
            let _ = task.await;
        }
        info!(listener = %self.config.name, "UDP listener stopped");
    }
}

/// Receive datagrams until shutdown, then cancel every session and drain
/// the reader tasks so each one runs its cleanup.
async fn read_loop(
    socket: Arc<UdpSocket>,
    proxy: Arc<UdpProxy>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut readers = JoinSet::new();
    let mut buf = vec![0u8; proxy.buffer_size()];

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            received = socket.recv_from(&mut buf) => {
                match received {
                    Ok((n, src_addr)) => {
                        if n > 0 {
                            Arc::clone(&proxy)
                                .handle_packet(buf[..n].to_vec(), src_addr, &socket, &mut readers)
                                .await;
                        }
                    }
                    Err(e) => {
                        if *shutdown.borrow() {
                            break;
                        }
                        error!(error = %e, "UDP read error");
                    }
                }
            }
            Some(_) = readers.join_next(), if !readers.is_empty() => {}
        }
    }

    proxy.sessions().close_all().await;
    while readers.join_next().await.is_some() {}
}

/// Periodically expire idle sessions.
async fn janitor(proxy: Arc<UdpProxy>, period: Duration, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(period) => proxy.expire_idle_sessions().await,
        }
    }
}
