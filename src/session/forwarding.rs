//! Session orchestrator: proxies, DNS engine and redirection rules
//!
//! ```text
//! spawn TCP proxy, UDP proxy, DNS engine
//!         |  (all started)
//!         v
//! build forwarder with bound ports -> check_prereqs -> add(subnets, dns_ips)
//!         |
//!         v
//! select! { shutdown | any component exits | forwarder fails }
//!         |
//!         v
//! reset forwarder -> stop TCP proxy -> stop UDP proxy -> stop DNS
//! ```

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ipnet::IpNet;
use tokio::sync::{broadcast, oneshot};
use tokio::task::{JoinError, JoinHandle};
use tracing::{error, info, warn};

use crate::dns::{DnsAddrs, DnsEngine};
use crate::error::{KwtNetError, Result, SessionError};
use crate::forwarder::{Forwarder, ForwarderFactory, LockingForwarder};
use crate::origdst::OriginalDstResolver;
use crate::proxy::{TcpProxy, UdpProxy};
use crate::subnets::subnets_as_string;
use crate::tunnel::Dialer;

/// How long a stopped component gets to wind down
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

fn loopback_ephemeral() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 0))
}

/// Wires the proxies, the DNS engine and the forwarder into one session
pub struct ForwardingProxy {
    forwarders: Arc<dyn ForwarderFactory>,
    orig_dst: Arc<dyn OriginalDstResolver>,
    dns: Arc<DnsEngine>,
    tcp_listen_addr: SocketAddr,
    udp_listen_addr: SocketAddr,
    shutdown_tx: broadcast::Sender<()>,
    active: AtomicBool,
}

impl ForwardingProxy {
    pub fn new(
        forwarders: Arc<dyn ForwarderFactory>,
        orig_dst: Arc<dyn OriginalDstResolver>,
        dns: Arc<DnsEngine>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            forwarders,
            orig_dst,
            dns,
            tcp_listen_addr: loopback_ephemeral(),
            udp_listen_addr: loopback_ephemeral(),
            shutdown_tx,
            active: AtomicBool::new(true),
        }
    }

    /// Listen addresses for the proxies; both default to `127.0.0.1:0`
    #[must_use]
    pub fn with_listen_addrs(mut self, tcp: SocketAddr, udp: SocketAddr) -> Self {
        self.tcp_listen_addr = tcp;
        self.udp_listen_addr = udp;
        self
    }

    /// Run a session until [`ForwardingProxy::shutdown`] or until a component
    /// fails
    ///
    /// Rules are installed only after every listener has bound, and are
    /// always reset before the listeners stop.
    ///
    /// # Errors
    ///
    /// Returns the first component failure. When the session itself ended
    /// cleanly, returns [`SessionError::Teardown`] if cleanup failed.
    pub async fn serve(
        &self,
        dialer: Arc<dyn Dialer>,
        subnets: &[IpNet],
        dns_ips: &[IpAddr],
    ) -> Result<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        if !self.active.load(Ordering::SeqCst) {
            return Ok(());
        }

        let tcp_proxy = Arc::new(TcpProxy::new(
            self.tcp_listen_addr,
            Arc::clone(&self.orig_dst),
            dialer,
        ));
        let udp_proxy = Arc::new(UdpProxy::new(self.udp_listen_addr));

        let (tcp_started_tx, tcp_started_rx) = oneshot::channel();
        let (udp_started_tx, udp_started_rx) = oneshot::channel();
        let (dns_started_tx, dns_started_rx) = oneshot::channel();

        let mut tcp_task = {
            let proxy = Arc::clone(&tcp_proxy);
            tokio::spawn(async move { proxy.serve(tcp_started_tx).await })
        };
        let mut udp_task = {
            let proxy = Arc::clone(&udp_proxy);
            tokio::spawn(async move { proxy.serve(udp_started_tx).await })
        };
        let mut dns_task = {
            let dns = Arc::clone(&self.dns);
            tokio::spawn(async move { dns.serve(dns_started_tx).await })
        };

        let forwarder = LockingForwarder::new();
        let install = async {
            // A component that never started reports why through its own task
            let (Ok(tcp_addr), Ok(_), Ok(dns_addrs)) =
                (tcp_started_rx.await, udp_started_rx.await, dns_started_rx.await)
            else {
                return std::future::pending().await;
            };
            install_forwarder(
                self.forwarders.as_ref(),
                &forwarder,
                tcp_addr.port(),
                dns_addrs,
                subnets,
                dns_ips,
            )
            .await
        };
        tokio::pin!(install);
        let mut installed = false;

        let outcome = loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => break Ok(()),
                joined = &mut tcp_task => break task_result("TCP proxy", joined),
                joined = &mut udp_task => break task_result("UDP proxy", joined),
                joined = &mut dns_task => break task_result("DNS server", joined),
                result = &mut install, if !installed => match result {
                    Ok(()) => installed = true,
                    Err(e) => break Err(e),
                },
            }
        };

        let mut errors = Vec::new();

        // Rules are not reclaimed by the kernel, so they go first
        if let Err(e) = reset_forwarder(&forwarder).await {
            error!(error = %e, "Failed resetting forwarder");
            errors.push(format!("resetting forwarder: {e}"));
        }

        tcp_proxy.shutdown();
        udp_proxy.shutdown();
        self.dns.shutdown();

        for (component, task) in [("TCP proxy", tcp_task), ("UDP proxy", udp_task)] {
            if let Err(e) = drain_task(component, task).await {
                error!(error = %e, "Failed shutting down {}", component);
                errors.push(e.to_string());
            }
        }
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

/// Build the platform forwarder for the bound ports and install the rules
///
/// The forwarder is handed to `forwarder` only after its prerequisites pass,
/// so a failed check leaves nothing to reset.
pub(super) async fn install_forwarder(
    factory: &dyn ForwarderFactory,
    forwarder: &LockingForwarder,
    tcp_port: u16,
    dns_addrs: DnsAddrs,
    subnets: &[IpNet],
    dns_ips: &[IpAddr],
) -> Result<()> {
    let actual = factory.new_forwarder(tcp_port, dns_addrs.tcp.port(), dns_addrs.udp.port())?;
    let actual = tokio::task::spawn_blocking(move || -> Result<Box<dyn Forwarder>> {
        actual.check_prereqs()?;
        Ok(actual)
    })
    .await
    .map_err(|e| SessionError::component("Forwarder", e))??;
    forwarder.set_forwarder(actual);

    if !subnets.is_empty() {
        info!("Forwarding subnets: {}", subnets_as_string(subnets));
    }

    let locking = forwarder.clone();
    let (subnets, dns_ips) = (subnets.to_vec(), dns_ips.to_vec());
    tokio::task::spawn_blocking(move || locking.add(&subnets, &dns_ips))
        .await
        .map_err(|e| SessionError::component("Forwarder", e))??;

    info!("Ready!");
    Ok(())
}

pub(super) async fn reset_forwarder(forwarder: &LockingForwarder) -> Result<()> {
    let forwarder = forwarder.clone();
    tokio::task::spawn_blocking(move || forwarder.reset())
        .await
        .map_err(|e| SessionError::component("Forwarder", e))??;
    Ok(())
}

/// Session outcome for a component task that exited
pub(super) fn task_result<E>(
    component: &'static str,
    joined: std::result::Result<std::result::Result<(), E>, JoinError>,
) -> Result<()>
where
    E: Into<KwtNetError>,
{
    match joined {
        Ok(Ok(())) => {
            info!("{} stopped", component);
            Ok(())
        }
        Ok(Err(e)) => Err(e.into()),
        Err(e) => Err(SessionError::component(component, e).into()),
    }
}

/// Wait for a component to wind down after shutdown
///
/// A task that already finished was reported by the main loop and is skipped.
pub(super) async fn drain_task<E>(
    component: &'static str,
    task: JoinHandle<std::result::Result<(), E>>,
) -> Result<()>
where
    E: Into<KwtNetError>,
{
    if task.is_finished() {
        return Ok(());
    }

    match tokio::time::timeout(SHUTDOWN_GRACE, task).await {
        Ok(joined) => task_result(component, joined),
        Err(_) => {
            warn!("{} did not stop within {:?}", component, SHUTDOWN_GRACE);
            Err(SessionError::component(component, "did not stop in time").into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::{DnsBuildOpts, StaticDomains};
    use crate::error::ForwarderError;
    use crate::origdst::StaticOrigDst;
    use crate::tunnel::LocalDialer;
    use parking_lot::Mutex;
    use std::collections::BTreeMap;

    #[derive(Default)]
    struct Recorded {
        ports: Mutex<Option<(u16, u16, u16)>>,
        calls: Mutex<Vec<String>>,
    }

    struct FakeForwarder {
        recorded: Arc<Recorded>,
        fail_prereqs: bool,
        fail_reset: bool,
        check_ports_on_reset: bool,
    }

    fn accepts_tcp(port: u16) -> bool {
        let addr = std::net::SocketAddr::from(([127, 0, 0, 1], port));
        std::net::TcpStream::connect_timeout(&addr, Duration::from_secs(1)).is_ok()
    }

    impl Forwarder for FakeForwarder {
        fn check_prereqs(&self) -> std::result::Result<(), ForwarderError> {
            self.recorded.calls.lock().push("check_prereqs".into());
            if self.fail_prereqs {
                return Err(ForwarderError::Prerequisite {
                    tool: "iptables".into(),
                    reason: "not found".into(),
                });
            }
            Ok(())
        }

        fn add(&mut self, subnets: &[IpNet], dns_ips: &[IpAddr]) -> std::result::Result<(), ForwarderError> {
            self.recorded
                .calls
                .lock()
                .push(format!("add {} {}", subnets.len(), dns_ips.len()));
            Ok(())
        }

        fn reset(&mut self) -> std::result::Result<(), ForwarderError> {
            if self.check_ports_on_reset {
                let ports = *self.recorded.ports.lock();
                if let Some((tcp, dns_tcp, _)) = ports {
                    let seen = format!(
                        "reset tcp={} dns={}",
                        accepts_tcp(tcp),
                        accepts_tcp(dns_tcp)
                    );
                    self.recorded.calls.lock().push(seen);
                }
            }
            self.recorded.calls.lock().push("reset".into());
            if self.fail_reset {
                return Err(ForwarderError::Multiple(vec!["flush failed".into()]));
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeFactory {
        recorded: Arc<Recorded>,
        fail_prereqs: bool,
        fail_reset: bool,
        check_ports_on_reset: bool,
    }

    impl ForwarderFactory for FakeFactory {
        fn new_forwarder(
            &self,
            dst_tcp_port: u16,
            dst_dns_tcp_port: u16,
            dst_dns_udp_port: u16,
        ) -> std::result::Result<Box<dyn Forwarder>, ForwarderError> {
            *self.recorded.ports.lock() = Some((dst_tcp_port, dst_dns_tcp_port, dst_dns_udp_port));
            Ok(Box::new(FakeForwarder {
                recorded: Arc::clone(&self.recorded),
                fail_prereqs: self.fail_prereqs,
                fail_reset: self.fail_reset,
                check_ports_on_reset: self.check_ports_on_reset,
            }))
        }
    }

    fn dns_engine() -> Arc<DnsEngine> {
        Arc::new(DnsEngine::build(DnsBuildOpts {
            listen_addr: loopback_ephemeral(),
            recursors: vec!["127.0.0.1:1".parse().unwrap()],
            domains: Arc::new(StaticDomains(BTreeMap::new())),
            on_changed: None,
            mdns_resolver: None,
        }))
    }

    fn proxy(factory: Arc<FakeFactory>) -> Arc<ForwardingProxy> {
        Arc::new(ForwardingProxy::new(
            factory,
            Arc::new(StaticOrigDst::new(loopback_ephemeral())),
            dns_engine(),
        ))
    }

    async fn wait_for_call(recorded: &Recorded, call: &str) {
        for _ in 0..200 {
            if recorded.calls.lock().iter().any(|c| c == call) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{call} was never recorded");
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    #[tokio::test]
    async fn test_installs_after_start_and_resets_on_shutdown() {
        let factory = Arc::new(FakeFactory::default());
        let recorded = Arc::clone(&factory.recorded);
        let proxy = proxy(factory);

        let serving = {
            let proxy = Arc::clone(&proxy);
            tokio::spawn(async move {
                let subnets = vec!["10.0.0.0/24".parse().unwrap()];
                let dns_ips = vec!["10.0.0.2".parse().unwrap()];
                proxy.serve(Arc::new(LocalDialer), &subnets, &dns_ips).await
            })
        };

        wait_for_call(&recorded, "add 1 1").await;
        let (tcp, dns_tcp, dns_udp) = recorded.ports.lock().unwrap();
        assert_ne!(tcp, 0);
        assert_ne!(dns_tcp, 0);
        assert_ne!(dns_udp, 0);

        proxy.shutdown();
        serving.await.unwrap().unwrap();

        assert_eq!(
            *recorded.calls.lock(),
            vec!["check_prereqs", "add 1 1", "reset"]
        );
    }

    #[tokio::test]
    async fn test_rules_reset_while_proxy_and_dns_still_listen() {
        let factory = Arc::new(FakeFactory {
            check_ports_on_reset: true,
            ..FakeFactory::default()
        });
        let recorded = Arc::clone(&factory.recorded);
        let proxy = proxy(factory);

        let serving = {
            let proxy = Arc::clone(&proxy);
            tokio::spawn(async move { proxy.serve(Arc::new(LocalDialer), &[], &[]).await })
        };
        wait_for_call(&recorded, "add 0 0").await;

        proxy.shutdown();
        serving.await.unwrap().unwrap();

        assert_eq!(
            *recorded.calls.lock(),
            vec!["check_prereqs", "add 0 0", "reset tcp=true dns=true", "reset"]
        );
    }

    #[tokio::test]
    async fn test_failed_prereqs_end_session_without_reset() {
        let factory = Arc::new(FakeFactory {
            fail_prereqs: true,
            ..FakeFactory::default()
        });
        let recorded = Arc::clone(&factory.recorded);

        let err = proxy(factory)
            .serve(Arc::new(LocalDialer), &[], &[])
            .await
            .unwrap_err();
        assert!(matches!(err, KwtNetError::Forwarder(ForwarderError::Prerequisite { .. })));
        assert_eq!(*recorded.calls.lock(), vec!["check_prereqs"]);
    }

    #[tokio::test]
    async fn test_teardown_errors_are_reported() {
        let factory = Arc::new(FakeFactory {
            fail_reset: true,
            ..FakeFactory::default()
        });
        let recorded = Arc::clone(&factory.recorded);
        let proxy = proxy(factory);

        let serving = {
            let proxy = Arc::clone(&proxy);
            tokio::spawn(async move { proxy.serve(Arc::new(LocalDialer), &[], &[]).await })
        };
        wait_for_call(&recorded, "add 0 0").await;

        proxy.shutdown();
        let err = serving.await.unwrap().unwrap_err();
        assert!(matches!(err, KwtNetError::Session(SessionError::Teardown(_))));
        assert!(err.to_string().contains("flush failed"));
    }

    #[tokio::test]
    async fn test_bind_failure_stops_session() {
        let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let factory = Arc::new(FakeFactory::default());
        let recorded = Arc::clone(&factory.recorded);

        let proxy = ForwardingProxy::new(
            factory,
            Arc::new(StaticOrigDst::new(loopback_ephemeral())),
            dns_engine(),
        )
        .with_listen_addrs(taken.local_addr().unwrap(), loopback_ephemeral());

        let err = proxy
            .serve(Arc::new(LocalDialer), &[], &[])
            .await
            .unwrap_err();
        assert!(matches!(err, KwtNetError::Proxy(_)));
        assert!(recorded.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_before_serve() {
        let factory = Arc::new(FakeFactory::default());
        let recorded = Arc::clone(&factory.recorded);
        let proxy = proxy(factory);
        proxy.shutdown();
        proxy.serve(Arc::new(LocalDialer), &[], &[]).await.unwrap();
        assert!(recorded.calls.lock().is_empty());
    }
}
