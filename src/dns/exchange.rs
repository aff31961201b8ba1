//! One query/reply exchange with a recursor
//!
//! The request bytes are sent unchanged so the reply carries the client's id.
//! UDP replies may be truncated; they are returned as-is and the client
//! decides whether to retry over TCP.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;
use tracing::trace;

use super::error::{DnsError, DnsResult};
use super::handler::Transport;
use super::server::tcp::{read_dns_message, write_dns_message, MAX_TCP_MESSAGE_SIZE};

/// Receive buffer for UDP replies
pub const UDP_RECV_BUFFER_SIZE: usize = 65535;

/// Exchange `request` with `recursor` over `transport`
///
/// # Errors
///
/// Returns [`DnsError::TimeoutError`] when no reply arrives in time, or
/// [`DnsError::NetworkError`] on socket failures.
pub async fn exchange(
    request: &[u8],
    recursor: SocketAddr,
    transport: Transport,
    deadline: Duration,
) -> DnsResult<Vec<u8>> {
    let exchanged = match transport {
        Transport::Udp => timeout(deadline, exchange_udp(request, recursor)).await,
        Transport::Tcp => timeout(deadline, exchange_tcp(request, recursor)).await,
    };

    exchanged.map_err(|_| DnsError::timeout(format!("{transport} query to {recursor}"), deadline))?
}

async fn exchange_udp(request: &[u8], recursor: SocketAddr) -> DnsResult<Vec<u8>> {
    let bind_addr: SocketAddr = if recursor.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };

    let socket = UdpSocket::bind(bind_addr)
        .await
        .map_err(|e| DnsError::network_io("failed to bind UDP socket", e))?;
    socket
        .connect(recursor)
        .await
        .map_err(|e| DnsError::network_io(format!("failed to connect to {recursor}"), e))?;
    socket
        .send(request)
        .await
        .map_err(|e| DnsError::network_io(format!("failed to send UDP query to {recursor}"), e))?;

    let mut buf = vec![0u8; UDP_RECV_BUFFER_SIZE];
    loop {
        let len = socket.recv(&mut buf).await.map_err(|e| {
            DnsError::network_io(format!("failed to receive UDP reply from {recursor}"), e)
        })?;

        // Stray datagrams with another id are skipped
        if len >= 2 && request.len() >= 2 && buf[..2] == request[..2] {
            trace!(recursor = %recursor, len = len, "Received UDP reply");
            return Ok(buf[..len].to_vec());
        }
    }
}

async fn exchange_tcp(request: &[u8], recursor: SocketAddr) -> DnsResult<Vec<u8>> {
    let mut stream = TcpStream::connect(recursor)
        .await
        .map_err(|e| DnsError::network_io(format!("failed to connect to {recursor}"), e))?;
    write_dns_message(&mut stream, request).await?;
    let reply = read_dns_message(&mut stream, MAX_TCP_MESSAGE_SIZE).await?;
    trace!(recursor = %recursor, len = reply.len(), "Received TCP reply");
    Ok(reply)
}
