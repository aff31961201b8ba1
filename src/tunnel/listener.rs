//! Remote listener that survives tunnel reconnects

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{watch, Mutex};
use tracing::{debug, warn};

use super::{BoxedListener, BoxedStream, Dialer, RemoteListener};
use crate::error::TunnelError;

/// Re-creates its remote listener whenever the current one hits EOF
///
/// Once [`RemoteListener::close`] is called, `accept` fails with
/// [`TunnelError::Closed`] and no new listener is created.
pub struct ReconnListener {
    addr: String,
    dialer: Arc<dyn Dialer>,
    current: Mutex<Option<BoxedListener>>,
    closed_tx: watch::Sender<bool>,
}

impl ReconnListener {
    /// Open the first remote listener on `addr`
    ///
    /// # Errors
    ///
    /// Returns the dialer's error if the first listener cannot be created.
    pub async fn bind(addr: impl Into<String>, dialer: Arc<dyn Dialer>) -> Result<Self, TunnelError> {
        let addr = addr.into();
        let first = dialer.new_listener(&addr).await?;
        let (closed_tx, _) = watch::channel(false);

        Ok(Self {
            addr,
            dialer,
            current: Mutex::new(Some(first)),
            closed_tx,
        })
    }

    /// Remote address this listener binds
    #[must_use]
    pub fn addr(&self) -> &str {
        &self.addr
    }

    fn is_closed(&self) -> bool {
        *self.closed_tx.borrow()
    }

    async fn accept_inner(&self) -> Result<(BoxedStream, String), TunnelError> {
        loop {
            if self.is_closed() {
                return Err(TunnelError::Closed);
            }

            let mut current = self.current.lock().await;
            if current.is_none() {
                debug!(addr = %self.addr, "Re-creating remote listener");
                *current = Some(self.dialer.new_listener(&self.addr).await?);
            }
            let Some(listener) = current.as_ref() else {
                continue;
            };

            match listener.accept().await {
                Ok(accepted) => return Ok(accepted),
                Err(e) if e.is_connection_broken() && !self.is_closed() => {
                    warn!(addr = %self.addr, error = %e, "Remote listener lost");
                    *current = None;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl RemoteListener for ReconnListener {
    async fn accept(&self) -> Result<(BoxedStream, String), TunnelError> {
        let mut closed_rx = self.closed_tx.subscribe();

        tokio::select! {
            result = self.accept_inner() => result,
            _ = closed_rx.wait_for(|closed| *closed) => Err(TunnelError::Closed),
        }
    }

    async fn close(&self) {
        self.closed_tx.send_replace(true);
        if let Some(listener) = self.current.lock().await.take() {
            listener.close().await;
        }
    }
}
