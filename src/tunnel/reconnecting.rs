//! Session wrapper that rebuilds a broken tunnel once per operation

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::{BoxedListener, BoxedStream, Dialer, Session, SessionFactory};
use crate::error::TunnelError;

/// [`Dialer`] that lazily opens a session and replaces it when it breaks
///
/// Operations share the live session under a read lock. Rebuilding takes the
/// write lock, so reconnects never overlap; a caller that loses the race
/// reuses the session the winner opened instead of tearing it down again.
pub struct ReconnectingTunnel {
    factory: Arc<dyn SessionFactory>,
    session: RwLock<Option<Arc<dyn Session>>>,
}

fn same_session(a: &Arc<dyn Session>, b: &Arc<dyn Session>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a).cast::<()>(),
        Arc::as_ptr(b).cast::<()>(),
    )
}

impl ReconnectingTunnel {
    pub fn new(factory: Arc<dyn SessionFactory>) -> Self {
        Self {
            factory,
            session: RwLock::new(None),
        }
    }

    /// Open the session now instead of on first use
    ///
    /// # Errors
    ///
    /// Returns the factory's error if no session could be opened.
    pub async fn connect(&self) -> Result<(), TunnelError> {
        self.current().await.map(|_| ())
    }

    /// Close and forget the live session, if any
    pub async fn disconnect(&self) {
        let session = self.session.write().await.take();
        if let Some(session) = session {
            session.disconnect().await;
            info!("Tunnel disconnected");
        }
    }

    /// Whether a session is currently held
    pub async fn is_connected(&self) -> bool {
        self.session.read().await.is_some()
    }

    async fn current(&self) -> Result<Arc<dyn Session>, TunnelError> {
        if let Some(session) = self.session.read().await.as_ref() {
            return Ok(session.clone());
        }
        self.reconnect(None).await
    }

    /// Replace `broken` with a fresh session
    ///
    /// With `broken == None` only a missing session is opened.
    async fn reconnect(
        &self,
        broken: Option<&Arc<dyn Session>>,
    ) -> Result<Arc<dyn Session>, TunnelError> {
        let mut guard = self.session.write().await;

        if let Some(current) = guard.as_ref() {
            let is_stale = broken.is_some_and(|b| same_session(b, current));
            if !is_stale {
                debug!("Reusing tunnel session opened by another caller");
                return Ok(current.clone());
            }
            current.disconnect().await;
            *guard = None;
        }

        let session = self.factory.open().await?;
        info!("Tunnel connected");
        *guard = Some(session.clone());
        Ok(session)
    }

    async fn with_retry<T, F, Fut>(&self, op_name: &str, op: F) -> Result<T, TunnelError>
    where
        F: Fn(Arc<dyn Session>) -> Fut + Send + Sync,
        Fut: Future<Output = Result<T, TunnelError>> + Send,
        T: Send,
    {
        let session = self.current().await?;

        match op(session.clone()).await {
            Err(e) if e.is_connection_broken() => {
                warn!(op = op_name, error = %e, "Tunnel connection broken, reconnecting");
                let fresh = self.reconnect(Some(&session)).await?;
                op(fresh).await
            }
            other => other,
        }
    }
}

#[async_trait]
impl Dialer for ReconnectingTunnel {
    async fn new_conn(&self, addr: &str) -> Result<BoxedStream, TunnelError> {
        self.with_retry("dial", |session| async move { session.new_conn(addr).await })
            .await
    }

    async fn new_listener(&self, addr: &str) -> Result<BoxedListener, TunnelError> {
        self.with_retry("listen", |session| async move { session.new_listener(addr).await })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};

    type Outcome = Result<(), TunnelError>;

    /// Session that replays scripted dial outcomes
    struct ScriptedSession {
        outcomes: Mutex<VecDeque<Outcome>>,
        dials: Arc<AtomicUsize>,
        disconnects: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Dialer for ScriptedSession {
        async fn new_conn(&self, _addr: &str) -> Result<BoxedStream, TunnelError> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            let outcome = self.outcomes.lock().pop_front().unwrap_or(Ok(()));
            outcome.map(|()| {
                let (a, _b) = tokio::io::duplex(8);
                Box::new(a) as BoxedStream
            })
        }

        async fn new_listener(&self, addr: &str) -> Result<BoxedListener, TunnelError> {
            Err(TunnelError::listen(addr, "unsupported"))
        }
    }

    #[async_trait]
    impl Session for ScriptedSession {
        async fn disconnect(&self) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Hands out one scripted session per `open`
    #[derive(Default)]
    struct ScriptedFactory {
        scripts: Mutex<VecDeque<Vec<Outcome>>>,
        opens: AtomicUsize,
        dials: Arc<AtomicUsize>,
        disconnects: Arc<AtomicUsize>,
    }

    impl ScriptedFactory {
        fn with_scripts(scripts: Vec<Vec<Outcome>>) -> Arc<Self> {
            Arc::new(Self {
                scripts: Mutex::new(scripts.into()),
                ..Self::default()
            })
        }
    }

    #[async_trait]
    impl SessionFactory for ScriptedFactory {
        async fn open(&self) -> Result<Arc<dyn Session>, TunnelError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            let outcomes = self.scripts.lock().pop_front().unwrap_or_default();
            Ok(Arc::new(ScriptedSession {
                outcomes: Mutex::new(outcomes.into()),
                dials: self.dials.clone(),
                disconnects: self.disconnects.clone(),
            }))
        }
    }

    fn broken_pipe() -> TunnelError {
        TunnelError::IoError(io::Error::new(io::ErrorKind::BrokenPipe, "broken pipe"))
    }

    // ========================================================================
    // Reconnect
    // ========================================================================

    #[tokio::test]
    async fn test_broken_pipe_reconnects_once_and_retries() {
        let factory = ScriptedFactory::with_scripts(vec![vec![Err(broken_pipe())], vec![]]);
        let tunnel = ReconnectingTunnel::new(factory.clone());

        assert!(tunnel.new_conn("10.0.0.1:80").await.is_ok());
        assert_eq!(factory.opens.load(Ordering::SeqCst), 2);
        assert_eq!(factory.dials.load(Ordering::SeqCst), 2);
        assert_eq!(factory.disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_happens_only_once() {
        let factory = ScriptedFactory::with_scripts(vec![
            vec![Err(broken_pipe())],
            vec![Err(TunnelError::ConnectionBroken("EOF".into()))],
        ]);
        let tunnel = ReconnectingTunnel::new(factory.clone());

        let err = tunnel.new_conn("10.0.0.1:80").await.err().unwrap();
        assert!(err.is_connection_broken());
        assert_eq!(factory.opens.load(Ordering::SeqCst), 2);
        assert_eq!(factory.dials.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_other_errors_are_returned_unchanged() {
        let factory = ScriptedFactory::with_scripts(vec![vec![Err(TunnelError::dial(
            "10.0.0.1:80",
            "connection refused",
        ))]]);
        let tunnel = ReconnectingTunnel::new(factory.clone());

        let err = tunnel.new_conn("10.0.0.1:80").await.err().unwrap();
        assert!(matches!(err, TunnelError::Dial { .. }));
        assert_eq!(factory.opens.load(Ordering::SeqCst), 1);
        assert_eq!(factory.dials.load(Ordering::SeqCst), 1);
        assert_eq!(factory.disconnects.load(Ordering::SeqCst), 0);
    }

    // ========================================================================
    // Session lifecycle
    // ========================================================================

    #[tokio::test]
    async fn test_session_is_lazy_and_shared() {
        let factory = ScriptedFactory::with_scripts(vec![]);
        let tunnel = ReconnectingTunnel::new(factory.clone());
        assert!(!tunnel.is_connected().await);

        tunnel.new_conn("10.0.0.1:80").await.unwrap();
        tunnel.new_conn("10.0.0.2:80").await.unwrap();
        assert!(tunnel.is_connected().await);
        assert_eq!(factory.opens.load(Ordering::SeqCst), 1);

        tunnel.disconnect().await;
        tunnel.disconnect().await;
        assert!(!tunnel.is_connected().await);
        assert_eq!(factory.disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stale_reconnect_reuses_fresh_session() {
        let factory = ScriptedFactory::with_scripts(vec![]);
        let tunnel = ReconnectingTunnel::new(factory.clone());

        let first = tunnel.current().await.unwrap();
        let second = tunnel.reconnect(Some(&first)).await.unwrap();
        assert!(!same_session(&first, &second));

        // A late caller still holding the first session must not rebuild
        let third = tunnel.reconnect(Some(&first)).await.unwrap();
        assert!(same_session(&second, &third));
        assert_eq!(factory.opens.load(Ordering::SeqCst), 2);
    }
}
