//! UDP interception placeholder
//!
//! Binds an ephemeral socket so the redirection rules have a UDP target, and
//! logs what arrives. Datagrams are not relayed.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio::net::UdpSocket;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info};

use crate::error::ProxyError;

const MAX_DATAGRAM_SIZE: usize = 65535;

/// Receives redirected datagrams and drops them
pub struct UdpProxy {
    listen_addr: SocketAddr,
    shutdown_tx: broadcast::Sender<()>,
    active: AtomicBool,
    received: AtomicU64,
}

impl UdpProxy {
    #[must_use]
    pub fn new(listen_addr: SocketAddr) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            listen_addr,
            shutdown_tx,
            active: AtomicBool::new(true),
            received: AtomicU64::new(0),
        }
    }

    /// Datagrams received so far
    #[must_use]
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    /// Bind, report the bound address through `started`, then read until
    /// [`UdpProxy::shutdown`]
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::BindError`] if the socket cannot be bound.
    pub async fn serve(&self, started: oneshot::Sender<SocketAddr>) -> Result<(), ProxyError> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        if !self.active.load(Ordering::SeqCst) {
            return Ok(());
        }

        let socket = UdpSocket::bind(self.listen_addr)
            .await
            .map_err(|e| ProxyError::bind(self.listen_addr, e.to_string()))?;
        let local_addr = socket.local_addr()?;
        info!(addr = %local_addr, "UDP proxy listening");
        let _ = started.send(local_addr);

        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            tokio::select! {
                received = socket.recv_from(&mut buf) => {
                    match received {
                        Ok((len, src)) => {
                            self.received.fetch_add(1, Ordering::Relaxed);
                            debug!(src = %src, len = len, "UDP datagram received, not forwarded");
                        }
                        Err(e) => debug!(error = %e, "UDP receive failed"),
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!(addr = %local_addr, "UDP proxy shutting down");
                    return Ok(());
                }
            }
        }
    }

    pub fn shutdown(&self) {
        self.active.store(false, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(());
    }
}
