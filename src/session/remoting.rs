//! Top-level session: credentials, subnets, tunnel, then forwarding

use std::sync::Arc;

use tracing::{debug, warn};

use super::forwarding::ForwardingProxy;
use crate::error::{Result, SessionError};
use crate::subnets::{DnsIps, Subnets};
use crate::tunnel::{EntryPoint, ReconnectingTunnel, SessionFactory, SshSessionFactory};

/// Drives a full forwarding session over a reconnecting tunnel
pub struct RemotingProxy {
    entry_point: Arc<dyn EntryPoint>,
    sessions: Arc<dyn SessionFactory>,
    subnets: Arc<dyn Subnets>,
    dns_ips: Arc<dyn DnsIps>,
    forwarding: ForwardingProxy,
}

impl RemotingProxy {
    /// Tunnel sessions are SSH sessions opened with the entry point's
    /// credentials
    pub fn new(
        entry_point: Arc<dyn EntryPoint>,
        subnets: Arc<dyn Subnets>,
        dns_ips: Arc<dyn DnsIps>,
        forwarding: ForwardingProxy,
    ) -> Self {
        let sessions = Arc::new(SshSessionFactory::new(Arc::clone(&entry_point)));
        Self {
            entry_point,
            sessions,
            subnets,
            dns_ips,
            forwarding,
        }
    }

    /// Replace how tunnel sessions are opened
    #[must_use]
    pub fn with_session_factory(mut self, sessions: Arc<dyn SessionFactory>) -> Self {
        self.sessions = sessions;
        self
    }

    /// Compute subnets and DNS IPs, connect the tunnel, then run the
    /// forwarding session until shutdown
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NoSubnets`] when nothing would be forwarded,
    /// the tunnel's error when the first connect fails, and otherwise
    /// whatever [`ForwardingProxy::serve`] returns.
    pub async fn serve(&self) -> Result<()> {
        let subnets = self.subnets.subnets().await?;
        if subnets.is_empty() {
            return Err(SessionError::NoSubnets.into());
        }

        let dns_ips = self.dns_ips.dns_ips().await?;

        let tunnel = Arc::new(ReconnectingTunnel::new(Arc::clone(&self.sessions)));

        // Connecting before the proxies start surfaces bad credentials early
        tunnel.connect().await?;

        let result = self
            .forwarding
            .serve(Arc::clone(&tunnel) as _, &subnets, &dns_ips)
            .await;

        tunnel.disconnect().await;
        match self.entry_point.delete().await {
            Ok(()) => debug!("Released entry point"),
            Err(e) => warn!(error = %e, "Failed releasing entry point"),
        }

        result
    }

    pub fn shutdown(&self) {
        self.forwarding.shutdown();
    }
}
