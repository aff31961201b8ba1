//! UDP DNS listener
//!
//! Each datagram is decoded and answered on its own task so a slow recursor
//! never stalls the receive loop.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tracing::{debug, error, info, trace, warn};

use crate::dns::error::{DnsError, DnsResult};
use crate::dns::handler::{Handler, Request, Transport};

/// Largest datagram accepted
pub const MAX_UDP_MESSAGE_SIZE: usize = 65535;

/// UDP DNS listener bound to one socket
pub struct UdpDnsServer {
    socket: Arc<UdpSocket>,
    handler: Arc<dyn Handler>,
    local_addr: SocketAddr,
}

impl UdpDnsServer {
    /// Bind `addr`
    ///
    /// # Errors
    ///
    /// Returns [`DnsError::NetworkError`] if the socket cannot be bound.
    pub async fn bind(addr: SocketAddr, handler: Arc<dyn Handler>) -> DnsResult<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| DnsError::network_io(format!("failed to bind UDP socket to {addr}"), e))?;

        let local_addr = socket
            .local_addr()
            .map_err(|e| DnsError::network_io("failed to get local address", e))?;

        debug!(addr = %local_addr, "UDP DNS server bound");

        Ok(Self {
            socket: Arc::new(socket),
            handler,
            local_addr,
        })
    }

    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Receive until `shutdown` fires
    ///
    /// # Errors
    ///
    /// Returns [`DnsError::NetworkError`] on a fatal socket error.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> DnsResult<()> {
        let mut buf = vec![0u8; MAX_UDP_MESSAGE_SIZE];

        loop {
            tokio::select! {
                received = self.socket.recv_from(&mut buf) => {
                    match received {
                        Ok((len, src)) => {
                            trace!(src = %src, len = len, "Received UDP DNS packet");
                            self.spawn_answer(buf[..len].to_vec(), src);
                        }
                        Err(e) if Self::is_fatal_error(&e) => {
                            error!(error = %e, "Fatal UDP error, shutting down");
                            return Err(DnsError::network_io("UDP recv_from failed", e));
                        }
                        Err(e) => debug!(error = %e, "Non-fatal UDP error"),
                    }
                }
                _ = shutdown.recv() => {
                    info!(addr = %self.local_addr, "UDP DNS server shutting down");
                    return Ok(());
                }
            }
        }
    }

    fn spawn_answer(&self, raw: Vec<u8>, src: SocketAddr) {
        let socket = Arc::clone(&self.socket);
        let handler = Arc::clone(&self.handler);

        tokio::spawn(async move {
            let request = match Request::decode(raw, src, Transport::Udp) {
                Ok(request) => request,
                Err(e) => {
                    debug!(src = %src, error = %e, "Dropping malformed query");
                    return;
                }
            };

            let response = match handler.handle(&request).await.into_bytes() {
                Ok(response) => response,
                Err(e) => {
                    error!(src = %src, error = %e, "Failed writing response");
                    return;
                }
            };

            if let Err(e) = socket.send_to(&response, src).await {
                warn!(dst = %src, error = %e, "Failed to send UDP response");
            }
        });
    }

    fn is_fatal_error(err: &io::Error) -> bool {
        matches!(
            err.kind(),
            io::ErrorKind::PermissionDenied | io::ErrorKind::AddrInUse
        )
    }
}
