//! Reverse forwarding: remote listener to a local address
//!
//! ```text
//! remote client ──> remote listener (tunnel) ──> accept ──> dial local ──> relay
//! ```

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tracing::{debug, error, info};

use crate::error::{Result, TunnelError};
use crate::proxy::relay;
use crate::tunnel::{BoxedStream, RemoteListener};

/// Accepts connections from a remote listener and relays them locally
pub struct ListenProxy {
    listener: Arc<dyn RemoteListener>,
    remote_addr: String,
    local_addr: SocketAddr,
    active: AtomicBool,
    accepted: AtomicU64,
}

impl ListenProxy {
    pub fn new(
        listener: Arc<dyn RemoteListener>,
        remote_addr: impl Into<String>,
        local_addr: SocketAddr,
    ) -> Self {
        Self {
            listener,
            remote_addr: remote_addr.into(),
            local_addr,
            active: AtomicBool::new(true),
            accepted: AtomicU64::new(0),
        }
    }

    /// Connections accepted so far
    #[must_use]
    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    /// Accept until the listener is closed
    ///
    /// # Errors
    ///
    /// Returns the listener's error unless it was closed through
    /// [`ListenProxy::shutdown`].
    pub async fn serve(&self, started: oneshot::Sender<()>) -> Result<()> {
        if !self.active.load(Ordering::SeqCst) {
            return Ok(());
        }

        info!("Forwarding {}->{}", self.remote_addr, self.local_addr);
        info!("Ready!");
        let _ = started.send(());

        loop {
            let (conn, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(TunnelError::Closed) => return Ok(()),
                Err(e) if !self.active.load(Ordering::SeqCst) => {
                    debug!(error = %e, "Accept ended after shutdown");
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            };

            self.accepted.fetch_add(1, Ordering::Relaxed);
            tokio::spawn(relay_to_local(conn, peer, self.local_addr));
        }
    }

    /// Close the remote listener; relays in flight finish on their own
    pub async fn shutdown(&self) {
        self.active.store(false, Ordering::SeqCst);
        self.listener.close().await;
    }
}

async fn relay_to_local(mut remote: BoxedStream, peer: String, local_addr: SocketAddr) {
    let mut local = match TcpStream::connect(local_addr).await {
        Ok(local) => local,
        Err(e) => {
            error!(peer = %peer, local = %local_addr, error = %e, "Could not connect to local address");
            return;
        }
    };

    local.set_nodelay(true).ok();
    debug!(peer = %peer, local = %local_addr, "Started");
    let result = relay(&mut remote, &mut local).await;
    debug!(
        peer = %peer,
        local = %local_addr,
        sent = result.src_to_dst,
        received = result.dst_to_src,
        "Finished"
    );
}
