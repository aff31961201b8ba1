//! SSH session used as the tunnel transport
//!
//! Outbound connections are `direct-tcpip` channels. Remote listeners are
//! `tcpip-forward` requests; the server's `forwarded-tcpip` channels are
//! routed to the matching listener by bound port.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use russh::client::{self, Handle, Msg};
use russh::{Channel, Disconnect};
use russh_keys::key;
use tokio::sync::{mpsc, Mutex as AsyncMutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{
    split_host_port, BoxedListener, BoxedStream, Dialer, EntryPoint, RemoteListener, Session,
    SessionFactory, SshOpts,
};
use crate::error::{is_broken_io, TunnelError};

/// Pending forwarded channels per listener
const FORWARD_BACKLOG: usize = 16;

type ForwardedConn = (Channel<Msg>, String);
type ForwardTable = Arc<Mutex<HashMap<u32, mpsc::Sender<ForwardedConn>>>>;

struct ClientHandler {
    host_public_key: Option<key::PublicKey>,
    forwards: ForwardTable,
}

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &key::PublicKey,
    ) -> Result<bool, Self::Error> {
        match &self.host_public_key {
            Some(expected) => {
                let matches = expected.fingerprint() == server_public_key.fingerprint();
                if !matches {
                    warn!(
                        fingerprint = %server_public_key.fingerprint(),
                        "SSH host key mismatch"
                    );
                }
                Ok(matches)
            }
            None => Ok(true),
        }
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        let tx = lookup_forward(&self.forwards, connected_port);
        let origin = format!("{originator_address}:{originator_port}");

        match tx {
            Some(tx) => {
                if tx.send((channel, origin)).await.is_err() {
                    debug!(port = connected_port, "Forwarded channel dropped, listener closed");
                }
            }
            None => {
                debug!(
                    address = connected_address,
                    port = connected_port,
                    "Forwarded channel for unknown listener"
                );
            }
        }
        Ok(())
    }
}

/// Classify an SSH error for the reconnect logic
fn map_ssh_error(addr: &str, err: russh::Error) -> TunnelError {
    match err {
        russh::Error::Disconnect | russh::Error::HUP | russh::Error::SendError => {
            TunnelError::ConnectionBroken(format!("{addr}: {err}"))
        }
        russh::Error::IO(ref e) if is_broken_io(e) => {
            TunnelError::ConnectionBroken(format!("{addr}: {err}"))
        }
        other => TunnelError::dial(addr, other.to_string()),
    }
}

/// One authenticated SSH connection
pub struct SshSession {
    host: String,
    handle: Arc<RwLock<Handle<ClientHandler>>>,
    forwards: ForwardTable,
    keepalive_task: Mutex<Option<JoinHandle<()>>>,
}

impl SshSession {
    /// Connect and authenticate with the private key in `opts`
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::Key`] for unparsable keys,
    /// [`TunnelError::Connect`] if the server is unreachable and
    /// [`TunnelError::Auth`] if the key is rejected.
    pub async fn connect(opts: &SshOpts) -> Result<Self, TunnelError> {
        let key_pair = russh_keys::decode_secret_key(&opts.private_key, None)
            .map_err(|e| TunnelError::Key(format!("private key: {e}")))?;
        let host_public_key = opts
            .host_public_key
            .as_deref()
            .map(russh_keys::parse_public_key_base64)
            .transpose()
            .map_err(|e| TunnelError::Key(format!("host public key: {e}")))?;

        let forwards: ForwardTable = Arc::default();
        let handler = ClientHandler {
            host_public_key,
            forwards: forwards.clone(),
        };
        let config = Arc::new(client::Config {
            keepalive_interval: Some(opts.keepalive),
            ..client::Config::default()
        });

        let mut handle = client::connect(config, opts.host.as_str(), handler)
            .await
            .map_err(|e| TunnelError::connect(&opts.host, e.to_string()))?;

        let authenticated = handle
            .authenticate_publickey(&opts.user, Arc::new(key_pair))
            .await
            .map_err(|e| TunnelError::Auth {
                user: opts.user.clone(),
                reason: e.to_string(),
            })?;
        if !authenticated {
            return Err(TunnelError::Auth {
                user: opts.user.clone(),
                reason: "public key rejected".into(),
            });
        }

        info!(host = %opts.host, user = %opts.user, "SSH session established");

        let handle = Arc::new(RwLock::new(handle));
        let keepalive_task = spawn_liveness_watch(
            opts.host.clone(),
            handle.clone(),
            forwards.clone(),
            opts.keepalive,
        );

        Ok(Self {
            host: opts.host.clone(),
            handle,
            forwards,
            keepalive_task: Mutex::new(Some(keepalive_task)),
        })
    }

    async fn ensure_open(&self, addr: &str) -> Result<(), TunnelError> {
        if self.handle.read().await.is_closed() {
            return Err(TunnelError::ConnectionBroken(format!(
                "{addr}: SSH session to {} closed",
                self.host
            )));
        }
        Ok(())
    }
}

/// Keepalives are sent by russh itself; this task notices a dead session and
/// closes every forward so remote listeners see EOF
fn spawn_liveness_watch(
    host: String,
    handle: Arc<RwLock<Handle<ClientHandler>>>,
    forwards: ForwardTable,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            if handle.read().await.is_closed() {
                warn!(host = %host, "SSH session closed by peer");
                forwards.lock().clear();
                break;
            }
        }
    })
}

#[async_trait]
impl Dialer for SshSession {
    async fn new_conn(&self, addr: &str) -> Result<BoxedStream, TunnelError> {
        let (host, port) = split_host_port(addr)?;
        self.ensure_open(addr).await?;

        let channel = self
            .handle
            .read()
            .await
            .channel_open_direct_tcpip(host, u32::from(port), "127.0.0.1", 0)
            .await
            .map_err(|e| map_ssh_error(addr, e))?;

        Ok(Box::new(channel.into_stream()))
    }

    async fn new_listener(&self, addr: &str) -> Result<BoxedListener, TunnelError> {
        let (host, port) = split_host_port(addr)?;
        self.ensure_open(addr).await?;

        // Held across the request so port 0 registrations never overlap
        let mut handle = self.handle.write().await;

        let requested = u32::from(port);
        let (tx, rx) = mpsc::channel(FORWARD_BACKLOG);
        self.forwards.lock().insert(requested, tx);

        let bound = match handle.tcpip_forward(host.clone(), requested).await {
            Ok(bound) => bound_port(requested, bound),
            Err(e) => {
                self.forwards.lock().remove(&requested);
                return Err(match map_ssh_error(addr, e) {
                    TunnelError::Dial { addr, reason } => TunnelError::Listen { addr, reason },
                    other => other,
                });
            }
        };
        rekey_forward(&self.forwards, requested, bound);
        drop(handle);

        debug!(addr = %addr, port = bound, "Remote SSH listener bound");
        Ok(Box::new(SshListener {
            host,
            port: bound,
            rx: AsyncMutex::new(rx),
            handle: self.handle.clone(),
            forwards: self.forwards.clone(),
        }))
    }
}

/// Port the server actually bound
///
/// Servers only report a port when asked for port 0.
const fn bound_port(requested: u32, reported: u32) -> u32 {
    if requested == 0 {
        reported
    } else {
        requested
    }
}

/// Move a listener registered under its requested port to its bound port
fn rekey_forward(forwards: &ForwardTable, requested: u32, bound: u32) {
    if requested == bound {
        return;
    }
    let mut table = forwards.lock();
    if let Some(tx) = table.remove(&requested) {
        table.insert(bound, tx);
    }
}

/// Listener for a forwarded channel
///
/// A channel can arrive before a port 0 listener has been moved to its
/// bound port, so that registration is the fallback.
fn lookup_forward(forwards: &ForwardTable, port: u32) -> Option<mpsc::Sender<ForwardedConn>> {
    let table = forwards.lock();
    table.get(&port).or_else(|| table.get(&0)).cloned()
}

#[async_trait]
impl Session for SshSession {
    async fn disconnect(&self) {
        if let Some(task) = self.keepalive_task.lock().take() {
            task.abort();
        }
        self.forwards.lock().clear();

        let handle = self.handle.read().await;
        if !handle.is_closed() {
            if let Err(e) = handle
                .disconnect(Disconnect::ByApplication, "", "en")
                .await
            {
                debug!(host = %self.host, error = %e, "SSH disconnect failed");
            }
        }
    }
}

struct SshListener {
    host: String,
    port: u32,
    rx: AsyncMutex<mpsc::Receiver<ForwardedConn>>,
    handle: Arc<RwLock<Handle<ClientHandler>>>,
    forwards: ForwardTable,
}

#[async_trait]
impl RemoteListener for SshListener {
    async fn accept(&self) -> Result<(BoxedStream, String), TunnelError> {
        match self.rx.lock().await.recv().await {
            Some((channel, origin)) => Ok((Box::new(channel.into_stream()), origin)),
            None => Err(TunnelError::ConnectionBroken(format!(
                "remote listener {}:{} EOF",
                self.host, self.port
            ))),
        }
    }

    async fn close(&self) {
        self.forwards.lock().remove(&self.port);

        let mut handle = self.handle.write().await;
        if !handle.is_closed() {
            if let Err(e) = handle.cancel_tcpip_forward(self.host.clone(), self.port).await {
                debug!(host = %self.host, port = self.port, error = %e, "Cancelling forward failed");
            }
        }
    }
}

/// Opens SSH sessions with credentials from an [`EntryPoint`]
pub struct SshSessionFactory {
    entry_point: Arc<dyn EntryPoint>,
}

impl SshSessionFactory {
    pub fn new(entry_point: Arc<dyn EntryPoint>) -> Self {
        Self { entry_point }
    }
}

#[async_trait]
impl SessionFactory for SshSessionFactory {
    async fn open(&self) -> Result<Arc<dyn Session>, TunnelError> {
        let opts = self.entry_point.entry_point().await?;
        let session = SshSession::connect(&opts).await?;
        Ok(Arc::new(session))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    fn opts(private_key: &str, host_public_key: Option<&str>) -> SshOpts {
        SshOpts {
            user: "tunnel".into(),
            host: "127.0.0.1:1".into(),
            private_key: private_key.into(),
            host_public_key: host_public_key.map(Into::into),
            keepalive: Duration::from_secs(3),
        }
    }

    #[test]
    fn test_error_classification() {
        let broken = map_ssh_error("10.0.0.1:80", russh::Error::Disconnect);
        assert!(broken.is_connection_broken());

        let reset = map_ssh_error(
            "10.0.0.1:80",
            russh::Error::IO(io::Error::new(io::ErrorKind::ConnectionReset, "reset")),
        );
        assert!(reset.is_connection_broken());

        let refused = map_ssh_error(
            "10.0.0.1:80",
            russh::Error::IO(io::Error::new(io::ErrorKind::ConnectionRefused, "refused")),
        );
        assert!(!refused.is_connection_broken());
        assert!(matches!(refused, TunnelError::Dial { .. }));
    }

    #[tokio::test]
    async fn test_bad_private_key_fails_before_connecting() {
        let err = SshSession::connect(&opts("not a key", None)).await.err().unwrap();
        assert!(matches!(err, TunnelError::Key(_)));
    }

    // ========================================================================
    // Forward table
    // ========================================================================

    #[test]
    fn test_port_zero_listener_uses_server_port() {
        assert_eq!(bound_port(0, 40123), 40123);
        assert_eq!(bound_port(8080, 0), 8080);
        assert_eq!(bound_port(8080, 8080), 8080);
    }

    #[test]
    fn test_forwarded_channels_reach_port_zero_listener() {
        let forwards: ForwardTable = Arc::default();
        let (pending_tx, _pending_rx) = mpsc::channel(1);
        forwards.lock().insert(0, pending_tx);

        // Before the listener is moved, unknown ports fall back to it
        assert!(lookup_forward(&forwards, 40123).is_some());

        rekey_forward(&forwards, 0, 40123);
        assert!(forwards.lock().contains_key(&40123));
        assert!(!forwards.lock().contains_key(&0));
        assert!(lookup_forward(&forwards, 40123).is_some());
        assert!(lookup_forward(&forwards, 9).is_none());

        // Explicit ports stay where they were registered
        let (fixed_tx, _fixed_rx) = mpsc::channel(1);
        forwards.lock().insert(8080, fixed_tx);
        rekey_forward(&forwards, 8080, 8080);
        assert!(lookup_forward(&forwards, 8080).is_some());
    }
}
