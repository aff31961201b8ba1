//! Redirected TCP connection relay
//!
//! ```text
//! kernel redirect ──> accept ──> original_dst() ──> tunnel new_conn()
//!                                                        |
//!                        relay both ways with half-close <┘
//! ```

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, error, info, warn};

use super::copy::relay;
use crate::error::ProxyError;
use crate::origdst::OriginalDstResolver;
use crate::tunnel::Dialer;

/// Accepts redirected connections and relays them through the tunnel
pub struct TcpProxy {
    listen_addr: SocketAddr,
    resolver: Arc<dyn OriginalDstResolver>,
    dialer: Arc<dyn Dialer>,
    shutdown_tx: broadcast::Sender<()>,
    active: AtomicBool,
    accepted: Arc<AtomicU64>,
}

impl TcpProxy {
    pub fn new(
        listen_addr: SocketAddr,
        resolver: Arc<dyn OriginalDstResolver>,
        dialer: Arc<dyn Dialer>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            listen_addr,
            resolver,
            dialer,
            shutdown_tx,
            active: AtomicBool::new(true),
            accepted: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Connections accepted so far
    #[must_use]
    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    /// Bind, report the bound address through `started`, then accept until
    /// [`TcpProxy::shutdown`]
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::BindError`] if the listener cannot be bound and
    /// [`ProxyError::AcceptError`] if accepting fails permanently.
    pub async fn serve(&self, started: oneshot::Sender<SocketAddr>) -> Result<(), ProxyError> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        if !self.active.load(Ordering::SeqCst) {
            return Ok(());
        }

        let listener = TcpListener::bind(self.listen_addr)
            .await
            .map_err(|e| ProxyError::bind(self.listen_addr, e.to_string()))?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "TCP proxy listening");
        let _ = started.send(local_addr);

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (conn, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            let err = ProxyError::IoError(e);
                            if err.is_recoverable() {
                                debug!(error = %err, "Transient accept error");
                                continue;
                            }
                            return Err(ProxyError::AcceptError(err.to_string()));
                        }
                    };
                    self.accepted.fetch_add(1, Ordering::Relaxed);
                    tokio::spawn(handle_conn(
                        conn,
                        peer,
                        self.resolver.clone(),
                        self.dialer.clone(),
                    ));
                }
                _ = shutdown_rx.recv() => {
                    info!(addr = %local_addr, "TCP proxy shutting down");
                    return Ok(());
                }
            }
        }
    }

    /// Stop accepting; relays already in flight finish on their own
    pub fn shutdown(&self) {
        self.active.store(false, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(());
    }
}

async fn handle_conn(
    mut src: TcpStream,
    peer: SocketAddr,
    resolver: Arc<dyn OriginalDstResolver>,
    dialer: Arc<dyn Dialer>,
) {
    let dst = match resolver.original_dst(&src) {
        Ok(dst) => dst,
        Err(e) => {
            warn!(peer = %peer, error = %e, "Could not retrieve original destination");
            return;
        }
    };

    let mut remote = match dialer.new_conn(&dst.to_string()).await {
        Ok(remote) => remote,
        Err(e) => {
            error!(peer = %peer, dst = %dst, error = %e, "Could not establish remote connection");
            return;
        }
    };

    src.set_nodelay(true).ok();
    debug!(peer = %peer, dst = %dst, "Started");
    let result = relay(&mut src, &mut remote).await;
    debug!(
        peer = %peer,
        dst = %dst,
        sent = result.src_to_dst,
        received = result.dst_to_src,
        "Finished"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::origdst::StaticOrigDst;
    use crate::tunnel::LocalDialer;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn echo_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut conn, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let (mut r, mut w) = conn.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                    let _ = w.shutdown().await;
                });
            }
        });
        addr
    }

    fn localhost() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[tokio::test]
    async fn test_relays_to_original_destination() {
        let echo = echo_server().await;
        let proxy = Arc::new(TcpProxy::new(
            localhost(),
            Arc::new(StaticOrigDst::new(echo)),
            Arc::new(LocalDialer),
        ));

        let (started_tx, started_rx) = oneshot::channel();
        let serving = {
            let proxy = proxy.clone();
            tokio::spawn(async move { proxy.serve(started_tx).await })
        };
        let proxy_addr = started_rx.await.unwrap();

        let mut client = TcpStream::connect(proxy_addr).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        client.shutdown().await.unwrap();
        let mut echoed = Vec::new();
        client.read_to_end(&mut echoed).await.unwrap();
        assert_eq!(echoed, b"ping");

        proxy.shutdown();
        serving.await.unwrap().unwrap();
        assert_eq!(proxy.accepted(), 1);
    }

    #[tokio::test]
    async fn test_dial_failure_closes_source_only() {
        let dead = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap()
        };
        let proxy = Arc::new(TcpProxy::new(
            localhost(),
            Arc::new(StaticOrigDst::new(dead)),
            Arc::new(LocalDialer),
        ));

        let (started_tx, started_rx) = oneshot::channel();
        let serving = {
            let proxy = proxy.clone();
            tokio::spawn(async move { proxy.serve(started_tx).await })
        };
        let proxy_addr = started_rx.await.unwrap();

        for _ in 0..2 {
            let mut client = TcpStream::connect(proxy_addr).await.unwrap();
            let mut buf = Vec::new();
            // Source is closed without data
            let n = client.read_to_end(&mut buf).await.unwrap_or(0);
            assert_eq!(n, 0);
        }

        assert!(!serving.is_finished());
        proxy.shutdown();
        serving.await.unwrap().unwrap();
        assert_eq!(proxy.accepted(), 2);
    }

    #[tokio::test]
    async fn test_bind_failure_is_reported() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy = TcpProxy::new(
            taken.local_addr().unwrap(),
            Arc::new(StaticOrigDst::new(localhost())),
            Arc::new(LocalDialer),
        );

        let (started_tx, started_rx) = oneshot::channel();
        let err = proxy.serve(started_tx).await.unwrap_err();
        assert!(matches!(err, ProxyError::BindError { .. }));
        assert!(started_rx.await.is_err());
    }
}
