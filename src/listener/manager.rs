//! Listener lifecycle coordination.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::config::{Config, Protocol};
use crate::logging::MultiLogger;
use crate::metrics::ProxyMetrics;

use super::error::{ListenerError, ListenerResult};
use super::tcp::TcpListener;
use super::udp::UdpListener;

/// One configured listener of either protocol.
#[derive(Debug)]
pub enum Listener {
    Tcp(TcpListener),
    Udp(UdpListener),
}

impl Listener {
    /// Listener name.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Listener::Tcp(listener) => listener.name(),
            Listener::Udp(listener) => listener.name(),
        }
    }

    /// The bound address, once started.
    #[must_use]
    pub fn bound_addr(&self) -> Option<SocketAddr> {
        match self {
            Listener::Tcp(listener) => listener.bound_addr(),
            Listener::Udp(listener) => listener.bound_addr(),
        }
    }

    async fn start(&mut self) -> ListenerResult<()> {
        match self {
            Listener::Tcp(listener) => listener.start().await,
            Listener::Udp(listener) => listener.start().await,
        }
    }

    async fn stop(&mut self) {
        match self {
            Listener::Tcp(listener) => listener.stop().await,
            Listener::Udp(listener) => listener.stop().await,
        }
    }
}

/// Owns every configured listener and drives their shared lifecycle.
#[derive(Debug)]
pub struct ListenerManager {
    listeners: Vec<Listener>,
}

impl ListenerManager {
    /// Build one listener per configured endpoint.
    pub fn new(
        config: &Config,
        logger: Arc<MultiLogger>,
        metrics: Arc<ProxyMetrics>,
    ) -> ListenerResult<Self> {
        let mut listeners = Vec::with_capacity(config.listeners.len());

        for listener_cfg in &config.listeners {
            let listener = match listener_cfg.protocol {
                Protocol::Tcp => Listener::Tcp(TcpListener::new(
                    listener_cfg.clone(),
                    Arc::clone(&logger),
                    Arc::clone(&metrics),
                )?),
                Protocol::Udp => Listener::Udp(UdpListener::new(
                    listener_cfg.clone(),
                    Arc::clone(&logger),
                    Arc::clone(&metrics),
                )?),
            };
            listeners.push(listener);
        }

        Ok(Self { listeners })
    }

    /// Number of managed listeners.
    #[must_use]
    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    /// Whether no listeners are configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// The managed listeners.
    #[must_use]
    pub fn listeners(&self) -> &[Listener] {
        &self.listeners
    }

    /// Start every listener in configuration order. A bind failure stops
    /// the listeners already started and surfaces the error.
    pub async fn start(&mut self) -> ListenerResult<()> {
        info!(count = self.listeners.len(), "starting all listeners");

        for index in 0..self.listeners.len() {
            if let Err(e) = self.listeners[index].start().await {
                error!(
                    listener = self.listeners[index].name(),
                    error = %e,
                    "failed to start listener"
                );
                for started in &mut self.listeners[..index] {
                    started.stop().await;
                }
                return Err(e);
            }
        }

        info!("all listeners started");
        Ok(())
    }

    /// Stop every listener, waiting for in-flight work.
    pub async fn stop(&mut self) {
        for listener in &mut self.listeners {
            listener.stop().await;
        }
    }

    /// Stop every listener, bounding the total wait. Returns a
    /// [`ListenerError::ShutdownTimeout`] when the budget expires first.
    pub async fn graceful_shutdown(&mut self, timeout: Duration) -> ListenerResult<()> {
        info!(timeout = ?timeout, "starting graceful shutdown");

        match tokio::time::timeout(timeout, self.stop()).await {
            Ok(()) => {
                info!("graceful shutdown completed");
                Ok(())
            }
            Err(_) => {
                warn!(timeout = ?timeout, "graceful shutdown timeout exceeded");
                Err(ListenerError::ShutdownTimeout(timeout))
            }
        }
    }
}
