//! DNS interception without subnet forwarding
//!
//! Runs the DNS engine and redirects port 53 traffic for the system's DNS
//! IPs to it. No TCP proxy runs; the forwarder still needs a TCP port to
//! name its rule set after, so a fixed placeholder is used.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, oneshot};
use tracing::{error, info};

use super::forwarding::{drain_task, install_forwarder, reset_forwarder, task_result};
use crate::dns::DnsEngine;
use crate::error::{Result, SessionError};
use crate::forwarder::{ForwarderFactory, LockingForwarder};
use crate::subnets::DnsIps;

/// TCP port the DNS-only rule set is named after
pub const DNS_ONLY_TCP_PORT: u16 = 1234;

/// DNS engine plus DNS-only redirection rules
pub struct DnsOnlyProxy {
    forwarders: Arc<dyn ForwarderFactory>,
    dns: Arc<DnsEngine>,
    dns_ips: Arc<dyn DnsIps>,
    shutdown_tx: broadcast::Sender<()>,
    active: AtomicBool,
}

impl DnsOnlyProxy {
    pub fn new(
        forwarders: Arc<dyn ForwarderFactory>,
        dns: Arc<DnsEngine>,
        dns_ips: Arc<dyn DnsIps>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            forwarders,
            dns,
            dns_ips,
            shutdown_tx,
            active: AtomicBool::new(true),
        }
    }

    /// Serve DNS and intercept port 53 until [`DnsOnlyProxy::shutdown`]
    ///
    /// # Errors
    ///
    /// Returns the DNS engine's or the forwarder's failure, or
    /// [`SessionError::Teardown`] if cleanup failed after a clean stop.
    pub async fn serve(&self) -> Result<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        if !self.active.load(Ordering::SeqCst) {
            return Ok(());
        }

        let (dns_started_tx, dns_started_rx) = oneshot::channel();
        let mut dns_task = {
            let dns = Arc::clone(&self.dns);
            tokio::spawn(async move { dns.serve(dns_started_tx).await })
        };

        let forwarder = LockingForwarder::new();
        let install = async {
            let Ok(dns_addrs) = dns_started_rx.await else {
                return std::future::pending().await;
            };
            let dns_ips = self.dns_ips.dns_ips().await?;
            install_forwarder(
                self.forwarders.as_ref(),
                &forwarder,
                DNS_ONLY_TCP_PORT,
                dns_addrs,
                &[],
                &dns_ips,
            )
            .await
        };
        tokio::pin!(install);
        let mut installed = false;

        let outcome = loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => break Ok(()),
                joined = &mut dns_task => break task_result("DNS server", joined),
                result = &mut install, if !installed => match result {
                    Ok(()) => installed = true,
                    Err(e) => break Err(e),
                },
            }
        };

        info!("Shutting down");
        let mut errors = Vec::new();

        if let Err(e) = reset_forwarder(&forwarder).await {
            error!(error = %e, "Failed resetting forwarder");
            errors.push(format!("resetting forwarder: {e}"));
        }

        self.dns.shutdown();
        if let Err(e) = drain_task("DNS server", dns_task).await {
            error!(error = %e, "Failed shutting down DNS server");
            errors.push(e.to_string());
        }

        match outcome {
            Err(e) => Err(e),
            Ok(()) if errors.is_empty() => Ok(()),
            Ok(()) => Err(SessionError::Teardown(errors).into()),
        }
    }

    pub fn shutdown(&self) {
        self.active.store(false, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(());
    }
}
