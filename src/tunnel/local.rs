//! Direct dialer without a tunnel

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};

use super::{BoxedListener, BoxedStream, Dialer, RemoteListener, Session};
use crate::error::TunnelError;

/// Dials and listens on the local host
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalDialer;

#[async_trait]
impl Dialer for LocalDialer {
    async fn new_conn(&self, addr: &str) -> Result<BoxedStream, TunnelError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| TunnelError::dial(addr, e.to_string()))?;
        stream.set_nodelay(true).ok();
        Ok(Box::new(stream))
    }

    async fn new_listener(&self, addr: &str) -> Result<BoxedListener, TunnelError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| TunnelError::listen(addr, e.to_string()))?;
        Ok(Box::new(LocalListener::new(listener)))
    }
}

#[async_trait]
impl Session for LocalDialer {
    async fn disconnect(&self) {}
}

/// [`RemoteListener`] over a local TCP listener
pub struct LocalListener {
    listener: TcpListener,
}

impl LocalListener {
    #[must_use]
    pub const fn new(listener: TcpListener) -> Self {
        Self { listener }
    }

    /// # Errors
    ///
    /// Returns the socket error if the address is unavailable.
    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }
}

#[async_trait]
impl RemoteListener for LocalListener {
    async fn accept(&self) -> Result<(BoxedStream, String), TunnelError> {
        let (stream, peer) = self.listener.accept().await?;
        Ok((Box::new(stream), peer.to_string()))
    }

    async fn close(&self) {}
}
