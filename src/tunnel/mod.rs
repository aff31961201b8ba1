//! Tunnel transport into the remote network
//!
//! A [`Dialer`] opens connections and listeners on the far side of the
//! tunnel. The production dialer is [`ReconnectingTunnel`] over SSH sessions
//! minted from an [`EntryPoint`]; [`LocalDialer`] dials directly and is used
//! when no tunnel is wanted (and in tests).
//!
//! # Reconnection
//!
//! ```text
//! new_conn(addr)
//!     |
//!     v
//! live session ──ok──> stream
//!     |
//!  broken pipe / EOF / reset
//!     |
//!     v
//! disconnect, open fresh session (write lock), retry once
//! ```

mod listener;
mod local;
mod reconnecting;
mod ssh;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::config::SshConfig;
use crate::error::TunnelError;

pub use listener::ReconnListener;
pub use local::{LocalDialer, LocalListener};
pub use reconnecting::ReconnectingTunnel;
pub use ssh::{SshSession, SshSessionFactory};

/// Byte stream carried over the tunnel
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// Type-erased tunnel stream
pub type BoxedStream = Box<dyn AsyncStream>;

/// Listener on the remote side of the tunnel
#[async_trait]
pub trait RemoteListener: Send + Sync {
    /// Wait for the next inbound connection
    ///
    /// Returns the stream and a printable description of its origin.
    ///
    /// # Errors
    ///
    /// A connection-broken [`TunnelError`] means the listener is dead and
    /// should be re-created.
    async fn accept(&self) -> Result<(BoxedStream, String), TunnelError>;

    /// Stop listening; pending and future `accept` calls fail
    async fn close(&self);
}

/// Type-erased remote listener
pub type BoxedListener = Box<dyn RemoteListener>;

/// Dials and listens through the tunnel
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Connect to `addr` (`host:port`) from inside the remote network
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError`] if the session is gone or the remote dial
    /// fails.
    async fn new_conn(&self, addr: &str) -> Result<BoxedStream, TunnelError>;

    /// Listen on `addr` (`host:port`) inside the remote network
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError`] if the remote side refuses the listener.
    async fn new_listener(&self, addr: &str) -> Result<BoxedListener, TunnelError>;
}

/// One live tunnel connection
#[async_trait]
pub trait Session: Dialer {
    /// Close the connection; safe to call more than once
    async fn disconnect(&self);
}

/// Opens new sessions for [`ReconnectingTunnel`]
#[async_trait]
pub trait SessionFactory: Send + Sync {
    /// # Errors
    ///
    /// Returns [`TunnelError`] if no session could be established.
    async fn open(&self) -> Result<Arc<dyn Session>, TunnelError>;
}

/// Credentials for an SSH session
#[derive(Clone)]
pub struct SshOpts {
    /// Login user
    pub user: String,
    /// `host:port` of the SSH server
    pub host: String,
    /// PEM encoded private key
    pub private_key: String,
    /// Base64 public key the server must present; any key is accepted when
    /// unset
    pub host_public_key: Option<String>,
    /// Interval between keepalive requests
    pub keepalive: Duration,
}

impl fmt::Debug for SshOpts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshOpts")
            .field("user", &self.user)
            .field("host", &self.host)
            .field("private_key", &"<redacted>")
            .field("host_public_key", &self.host_public_key)
            .field("keepalive", &self.keepalive)
            .finish()
    }
}

/// Source of tunnel credentials
#[async_trait]
pub trait EntryPoint: Send + Sync {
    /// Provide credentials for a new session
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::EntryPoint`] if no credentials are available.
    async fn entry_point(&self) -> Result<SshOpts, TunnelError>;

    /// Release whatever the entry point provisioned
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::EntryPoint`] if cleanup fails.
    async fn delete(&self) -> Result<(), TunnelError>;
}

/// Entry point backed by fixed, configured SSH credentials
#[derive(Debug, Clone)]
pub struct StaticSshEntryPoint {
    opts: SshOpts,
}

impl StaticSshEntryPoint {
    #[must_use]
    pub const fn new(opts: SshOpts) -> Self {
        Self { opts }
    }

    /// Build from the `ssh` config section
    ///
    /// `private_key` may be PEM text or a path to a PEM file.
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::Key`] if the key file cannot be read.
    pub fn from_config(config: &SshConfig) -> Result<Self, TunnelError> {
        let private_key = if config.private_key.contains("-----BEGIN") {
            config.private_key.clone()
        } else {
            std::fs::read_to_string(&config.private_key).map_err(|e| {
                TunnelError::Key(format!("reading '{}': {}", config.private_key, e))
            })?
        };

        Ok(Self::new(SshOpts {
            user: config.user.clone(),
            host: config.host.clone(),
            private_key,
            host_public_key: config.host_public_key.clone(),
            keepalive: Duration::from_secs(config.keepalive_secs),
        }))
    }
}

#[async_trait]
impl EntryPoint for StaticSshEntryPoint {
    async fn entry_point(&self) -> Result<SshOpts, TunnelError> {
        Ok(self.opts.clone())
    }

    async fn delete(&self) -> Result<(), TunnelError> {
        Ok(())
    }
}

/// Split `host:port`, accepting bracketed IPv6 hosts
///
/// # Errors
///
/// Returns [`TunnelError::Dial`] if the port is missing or invalid.
pub fn split_host_port(addr: &str) -> Result<(String, u16), TunnelError> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| TunnelError::dial(addr, "missing port"))?;
    let port = port
        .parse::<u16>()
        .map_err(|e| TunnelError::dial(addr, format!("invalid port: {e}")))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    Ok((host.to_string(), port))
}
