//! DNS listeners
//!
//! [`DnsServer`] binds one TCP and one UDP listener on the same address and
//! feeds both into a single [`Handler`]. With port 0 the two listeners get
//! independent ephemeral ports, which is why [`DnsAddrs`] carries both.
//!
//! ```text
//! TCP listener --+
//!                +--> Handler (DomainsMux) --> reply
//! UDP listener --+
//!
//! optional: MdnsServer on 224.0.0.251:5353
//! ```

pub mod tcp;
pub mod udp;

pub use tcp::TcpDnsServer;
pub use udp::UdpDnsServer;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::info;

use super::error::{DnsError, DnsResult};
use super::handler::Handler;
use super::mdns::MdnsServer;

/// Where the DNS server ended up listening
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DnsAddrs {
    pub tcp: SocketAddr,
    pub udp: SocketAddr,
}

/// TCP + UDP DNS server, optionally paired with an mDNS responder
pub struct DnsServer {
    listen_addr: SocketAddr,
    handler: Arc<dyn Handler>,
    mdns: Option<Arc<MdnsServer>>,
    shutdown_tx: broadcast::Sender<()>,
    active: AtomicBool,
}

impl DnsServer {
    pub fn new(listen_addr: SocketAddr, handler: Arc<dyn Handler>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            listen_addr,
            handler,
            mdns: None,
            shutdown_tx,
            active: AtomicBool::new(true),
        }
    }

    #[must_use]
    pub fn with_mdns(mut self, mdns: Arc<MdnsServer>) -> Self {
        self.mdns = Some(mdns);
        self
    }

    /// Shutdown signal shared with background refresh tasks
    #[must_use]
    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Bind both listeners, report their addresses through `started`, then
    /// serve until [`DnsServer::shutdown`]
    ///
    /// `started` fires only once the mDNS responder, if any, has started too.
    ///
    /// # Errors
    ///
    /// Returns [`DnsError::NetworkError`] if binding fails or a listener
    /// hits a fatal socket error.
    pub async fn serve(&self, started: oneshot::Sender<DnsAddrs>) -> DnsResult<()> {
        let tcp_shutdown = self.shutdown_tx.subscribe();
        let udp_shutdown = self.shutdown_tx.subscribe();
        if !self.active.load(Ordering::SeqCst) {
            return Ok(());
        }

        let tcp = TcpDnsServer::bind(self.listen_addr, Arc::clone(&self.handler)).await?;
        let udp = UdpDnsServer::bind(self.listen_addr, Arc::clone(&self.handler)).await?;
        let addrs = DnsAddrs {
            tcp: tcp.local_addr(),
            udp: udp.local_addr(),
        };

        let mdns_task = match &self.mdns {
            Some(mdns) => {
                let mdns = Arc::clone(mdns);
                let (mdns_started_tx, mdns_started_rx) = oneshot::channel();
                let handle = tokio::spawn(async move { mdns.serve(mdns_started_tx).await });
                if mdns_started_rx.await.is_err() {
                    // Ended before binding: either shut down or failed
                    return join_mdns(handle).await;
                }
                Some(handle)
            }
            None => None,
        };

        info!("Started DNS server on {} (TCP) and {} (UDP)", addrs.tcp, addrs.udp);
        let _ = started.send(addrs);

        let mdns_done = async {
            match mdns_task {
                Some(handle) => join_mdns(handle).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            result = tcp.run(tcp_shutdown) => result.map_err(serving_error),
            result = udp.run(udp_shutdown) => result.map_err(serving_error),
            result = mdns_done => result,
        }
    }

    pub fn shutdown(&self) {
        self.active.store(false, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(());
        if let Some(mdns) = &self.mdns {
            mdns.shutdown();
        }
    }
}

fn serving_error(e: DnsError) -> DnsError {
    DnsError::network(format!("Serving: {e}"))
}

async fn join_mdns(handle: JoinHandle<DnsResult<()>>) -> DnsResult<()> {
    handle
        .await
        .map_err(|e| DnsError::internal(format!("mDNS task: {e}")))?
}
