//! TCP DNS listener
//!
//! Messages are framed with a 2-byte big-endian length prefix. A connection
//! may carry several queries; it is closed after [`IDLE_TIMEOUT`] without one.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::timeout;
use tracing::{debug, error, info, trace};

use crate::dns::error::{DnsError, DnsResult};
use crate::dns::handler::{Handler, Request, Transport};

/// Maximum DNS message size over TCP
pub const MAX_TCP_MESSAGE_SIZE: usize = 65535;

/// Minimum valid DNS message size (header only)
pub const MIN_DNS_MESSAGE_SIZE: usize = 12;

/// Time a connection may sit without a query
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(8);

/// TCP DNS listener
pub struct TcpDnsServer {
    listener: TcpListener,
    handler: Arc<dyn Handler>,
    local_addr: SocketAddr,
}

impl TcpDnsServer {
    /// Bind `addr`
    ///
    /// # Errors
    ///
    /// Returns [`DnsError::NetworkError`] if the socket cannot be bound.
    pub async fn bind(addr: SocketAddr, handler: Arc<dyn Handler>) -> DnsResult<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| DnsError::network_io(format!("failed to bind TCP socket to {addr}"), e))?;

        let local_addr = listener
            .local_addr()
            .map_err(|e| DnsError::network_io("failed to get local address", e))?;

        debug!(addr = %local_addr, "TCP DNS server bound");

        Ok(Self {
            listener,
            handler,
            local_addr,
        })
    }

    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept until `shutdown` fires
    ///
    /// # Errors
    ///
    /// Returns [`DnsError::NetworkError`] on a fatal accept error.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> DnsResult<()> {
        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => self.handle_connection(stream, peer_addr),
                        Err(e) if Self::is_fatal_error(&e) => {
                            error!(error = %e, "Fatal TCP accept error");
                            return Err(DnsError::network_io("accept failed", e));
                        }
                        Err(e) => debug!(error = %e, "Non-fatal accept error"),
                    }
                }
                _ = shutdown.recv() => {
                    info!(addr = %self.local_addr, "TCP DNS server shutting down");
                    return Ok(());
                }
            }
        }
    }

    fn handle_connection(&self, stream: TcpStream, peer_addr: SocketAddr) {
        let handler = Arc::clone(&self.handler);

        tokio::spawn(async move {
            if let Err(e) = Self::handle_connection_inner(stream, peer_addr, handler).await {
                debug!(peer = %peer_addr, error = %e, "Connection error");
            }
        });
    }

    async fn handle_connection_inner(
        mut stream: TcpStream,
        peer_addr: SocketAddr,
        handler: Arc<dyn Handler>,
    ) -> DnsResult<()> {
        trace!(peer = %peer_addr, "Handling TCP connection");

        loop {
            let message = match timeout(
                IDLE_TIMEOUT,
                read_dns_message(&mut stream, MAX_TCP_MESSAGE_SIZE),
            )
            .await
            {
                Ok(Ok(msg)) => msg,
                // Closed by the peer
                Ok(Err(DnsError::NetworkError { .. })) => return Ok(()),
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    debug!(peer = %peer_addr, "Connection idle timeout");
                    return Ok(());
                }
            };

            let request = Request::decode(message, peer_addr, Transport::Tcp)?;
            let response = handler.handle(&request).await.into_bytes()?;
            write_dns_message(&mut stream, &response).await?;
        }
    }

    fn is_fatal_error(err: &io::Error) -> bool {
        matches!(
            err.kind(),
            io::ErrorKind::PermissionDenied | io::ErrorKind::AddrInUse
        )
    }
}

/// Read a DNS message (2-byte length prefix + message)
pub(crate) async fn read_dns_message<S>(stream: &mut S, max_size: usize) -> DnsResult<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 2];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
            return Err(DnsError::network("connection closed"));
        }
        Err(e) => {
            return Err(DnsError::network_io("failed to read length prefix", e));
        }
    }

    let len = usize::from(u16::from_be_bytes(len_buf));

    if len < MIN_DNS_MESSAGE_SIZE {
        return Err(DnsError::parse(format!(
            "message too small: {len} bytes (min: {MIN_DNS_MESSAGE_SIZE})"
        )));
    }

    if len > max_size {
        return Err(DnsError::parse(format!(
            "message too large: {len} bytes (max: {max_size})"
        )));
    }

    let mut message = vec![0u8; len];
    stream
        .read_exact(&mut message)
        .await
        .map_err(|e| DnsError::network_io("failed to read message body", e))?;

    Ok(message)
}

/// Write a DNS message (2-byte length prefix + message)
pub(crate) async fn write_dns_message<S>(stream: &mut S, message: &[u8]) -> DnsResult<()>
where
    S: AsyncWrite + Unpin,
{
    let len = u16::try_from(message.len()).map_err(|_| {
        DnsError::serialize(format!(
            "response too large: {} bytes (max: {MAX_TCP_MESSAGE_SIZE})",
            message.len()
        ))
    })?;

    let mut framed = Vec::with_capacity(message.len() + 2);
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(message);

    stream
        .write_all(&framed)
        .await
        .map_err(|e| DnsError::network_io("failed to write message", e))?;
    stream
        .flush()
        .await
        .map_err(|e| DnsError::network_io("failed to flush", e))?;

    Ok(())
}
