//! Multicast DNS responder for `.local`
//!
//! Joins 224.0.0.251:5353 and answers A/AAAA questions sent from this host.

mod filter;
mod handler;

pub use filter::{LocalIfaceFilter, IFACE_REFRESH_INTERVAL};
pub use handler::{MdnsHandler, MdnsReply, MDNS_TTL};

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use hickory_proto::op::Message;
use hickory_proto::serialize::binary::BinEncodable;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, error, info};

use super::error::{DnsError, DnsResult};
use super::resolver::IpResolver;

/// Domain served over multicast
pub const MDNS_DOMAIN: &str = "local.";

/// mDNS IPv4 group
pub const MDNS_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 251);

/// mDNS port
pub const MDNS_PORT: u16 = 5353;

const MAX_MESSAGE_SIZE: usize = 65536;

/// Multicast responder with a local source filter
pub struct MdnsServer {
    handler: Arc<MdnsHandler>,
    filter: Arc<LocalIfaceFilter>,
    group: SocketAddrV4,
    shutdown_tx: broadcast::Sender<()>,
    active: AtomicBool,
}

impl MdnsServer {
    #[must_use]
    pub fn new(resolver: IpResolver) -> Self {
        Self::with_group(resolver, SocketAddrV4::new(MDNS_GROUP, MDNS_PORT))
    }

    /// Responder on a non-standard group or port
    #[must_use]
    pub fn with_group(resolver: IpResolver, group: SocketAddrV4) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            handler: Arc::new(MdnsHandler::new(resolver)),
            filter: Arc::new(LocalIfaceFilter::new()),
            group,
            shutdown_tx,
            active: AtomicBool::new(true),
        }
    }

    fn bind(&self) -> DnsResult<UdpSocket> {
        let io_err = |what: &str, e| DnsError::network_io(format!("Listening multicast udp4: {what}"), e);

        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .map_err(|e| io_err("socket", e))?;
        socket
            .set_reuse_address(true)
            .map_err(|e| io_err("SO_REUSEADDR", e))?;
        #[cfg(unix)]
        socket
            .set_reuse_port(true)
            .map_err(|e| io_err("SO_REUSEPORT", e))?;
        socket
            .bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.group.port())).into())
            .map_err(|e| io_err("bind", e))?;
        socket
            .join_multicast_v4(self.group.ip(), &Ipv4Addr::UNSPECIFIED)
            .map_err(|e| io_err("join", e))?;
        socket
            .set_multicast_loop_v4(true)
            .map_err(|e| io_err("IP_MULTICAST_LOOP", e))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| io_err("O_NONBLOCK", e))?;

        UdpSocket::from_std(socket.into()).map_err(|e| io_err("register", e))
    }

    /// Join the group, report the bound address through `started`, then
    /// answer until [`MdnsServer::shutdown`]
    ///
    /// # Errors
    ///
    /// Returns [`DnsError::NetworkError`] if the multicast socket cannot be
    /// set up.
    pub async fn serve(&self, started: oneshot::Sender<SocketAddr>) -> DnsResult<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        if !self.active.load(Ordering::SeqCst) {
            return Ok(());
        }

        let socket = Arc::new(self.bind()?);
        let local_addr = socket.local_addr()?;
        let _ = started.send(local_addr);
        info!(addr = %local_addr, group = %self.group, "Started mDNS resolver");

        tokio::spawn(
            Arc::clone(&self.filter).update_continuously(self.shutdown_tx.subscribe()),
        );

        let mut buf = vec![0u8; MAX_MESSAGE_SIZE];
        loop {
            tokio::select! {
                received = socket.recv_from(&mut buf) => {
                    match received {
                        Ok((len, src)) => self.dispatch(&socket, &buf[..len], src),
                        Err(e) => error!(error = %e, "Failed reading msg"),
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("mDNS resolver shutting down");
                    return Ok(());
                }
            }
        }
    }

    fn dispatch(&self, socket: &Arc<UdpSocket>, raw: &[u8], src: SocketAddr) {
        let query = match Message::from_vec(raw) {
            Ok(query) => query,
            Err(e) => {
                debug!(src = %src, error = %e, "Unpacking msg");
                return;
            }
        };

        // Empty packets and our own answers
        if query.queries().is_empty() {
            return;
        }
        if !self.filter.accept(src.ip()) {
            debug!(src = %src, "Ignoring non-local query");
            return;
        }

        let handler = Arc::clone(&self.handler);
        let socket = Arc::clone(socket);
        let group = SocketAddr::V4(self.group);

        tokio::spawn(async move {
            let Some(reply) = handler.answer(&query).await else {
                return;
            };
            let dst = if reply.unicast { src } else { group };

            match reply.message.to_bytes() {
                Ok(bytes) => {
                    if let Err(e) = socket.send_to(&bytes, dst).await {
                        error!(dst = %dst, error = %e, "Failed writing resp");
                    }
                }
                Err(e) => error!(error = %e, "Failed packing resp"),
            }
        });
    }

    pub fn shutdown(&self) {
        self.active.store(false, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(());
    }
}
