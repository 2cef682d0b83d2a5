//! TCP listener: accept loop and per-connection handler tasks.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener as TokioTcpListener;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{error, info};

use crate::acl::Allowlist;
use crate::config::ListenerConfig;
use crate::logging::MultiLogger;
use crate::metrics::ProxyMetrics;
use crate::proxy::TcpProxy;
use crate::ratelimit::RateLimitManager;

use super::error::{ListenerError, ListenerResult};

/// A bound TCP endpoint and its forwarding pipeline.
///
/// Must be created inside a tokio runtime; the rate limiter spawns its
/// reclamation tasks at construction.
#[derive(Debug)]
pub struct TcpListener {
    config: Arc<ListenerConfig>,
    proxy: Arc<TcpProxy>,
    limiter: Arc<RateLimitManager>,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
    bound_addr: Option<SocketAddr>,
}

impl TcpListener {
    /// Build the listener from its configuration.
    pub fn new(
        config: ListenerConfig,
        logger: Arc<MultiLogger>,
        metrics: Arc<ProxyMetrics>,
    ) -> ListenerResult<Self> {
        let allowlist = Allowlist::new(&config.allowlist)?;
        let limiter = Arc::new(RateLimitManager::new(&config.rate_limits));
        let config = Arc::new(config);
        let proxy = Arc::new(TcpProxy::new(
            Arc::clone(&config),
            logger,
            Arc::clone(&limiter),
            allowlist,
            metrics,
        ));
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            config,
            proxy,
            limiter,
            shutdown,
            task: None,
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

    /// Bind the listen socket and start the accept loop.
    pub async fn start(&mut self) -> ListenerResult<()> {
        if self.task.is_some() {
            return Err(ListenerError::AlreadyRunning(self.config.name.clone()));
        }

        let listener = TokioTcpListener::bind(&self.config.listen_address)
            .await
            .map_err(|e| ListenerError::Bind {
                addr: self.config.listen_address.clone(),
                source: e,
            })?;
        self.bound_addr = listener.local_addr().ok();

        info!(
            listener = %self.config.name,
            address = %self.config.listen_address,
            target = %self.config.target_address,
            "TCP listener started"
        );

        let proxy = Arc::clone(&self.proxy);
        let shutdown = self.shutdown.subscribe();
        self.task = Some(tokio::spawn(accept_loop(listener, proxy, shutdown)));
        Ok(())
    }

    /// Stop accepting, cancel in-flight handlers, and wait for them.
    pub async fn stop(&mut self) {
        info!(listener = %self.config.name, "stopping TCP listener");
        let _ = self.shutdown.send(true);
        self.limiter.close();

        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        info!(listener = %self.config.name, "TCP listener stopped");
    }
}

/// Accept connections until shutdown, then drain the handler tasks.
async fn accept_loop(
    listener: TokioTcpListener,
    proxy: Arc<TcpProxy>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut handlers = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer_addr)) => {
                        let proxy = Arc::clone(&proxy);
                        let conn_shutdown = shutdown.clone();
                        handlers.spawn(proxy.handle_connection(stream, peer_addr, conn_shutdown));
                    }
                    Err(e) => {
                        if *shutdown.borrow() {
                            break;
                        }
                        error!(error = %e, "accept error");
                    }
                }
            }
            // Reap finished handlers so the set stays bounded.
            Some(_) = handlers.join_next(), if !handlers.is_empty() => {}
        }
    }

    drop(listener);
    while handlers.join_next().await.is_some() {}
}
