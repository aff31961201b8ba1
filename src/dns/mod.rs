//! DNS resolution engine
//!
//! Answers cluster-internal and mapped names authoritatively and forwards
//! everything else to upstream recursors with failover.
//!
//! # Architecture
//!
//! ```text
//! Client query (TCP/UDP)
//!     |
//!     v
//! DnsServer --> DomainsMux --+--> CustomHandler(IpResolver)  mapped domains, local.
//!                            |--> ArpaHandler --> ForwardHandler
//!                            `--> ForwardHandler --> FailoverRecursorPool --> recursors
//!
//! MdnsServer (224.0.0.251:5353) --> MdnsHandler(IpResolver)
//! ```
//!
//! # Components
//!
//! - [`pool`]: recursor failover with a sliding failure window
//! - [`resolver`] and [`cluster`]: name to IP resolution
//! - [`handler`]: custom, forward and arpa handlers
//! - [`mux`]: domain table routing with periodic refresh
//! - [`server`]: TCP and UDP listeners
//! - [`mdns`]: multicast responder for `.local`

pub mod cluster;
pub mod domains_exec;
pub mod error;
pub mod exchange;
pub mod handler;
pub mod mdns;
pub mod mux;
pub mod os_cache;
pub mod pool;
pub mod resolv_conf;
pub mod resolver;
pub mod server;

pub use cluster::{
    pod_internal_dns_address, service_internal_dns_address, ClusterResolver,
    KubectlServiceDirectory, ServiceDirectory, StaticServiceDirectory, DEFAULT_CLUSTER_SUFFIX,
};
pub use domains_exec::ExecDomains;
pub use error::{DnsError, DnsResult};
pub use handler::{ArpaHandler, CustomHandler, ForwardHandler, Handler, Reply, Request, Transport};
pub use mdns::{MdnsServer, MDNS_DOMAIN};
pub use mux::{DomainsChanged, DomainsMux, DomainsSource, StaticDomains};
pub use os_cache::OsDnsCache;
pub use pool::FailoverRecursorPool;
pub use resolv_conf::ResolvConf;
pub use resolver::{IpResolver, Resolution};
pub use server::{DnsAddrs, DnsServer};

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::oneshot;
use tracing::warn;

use crate::config::Config;
use crate::forwarder::CmdExecutor;

/// Everything needed to assemble a [`DnsEngine`]
pub struct DnsBuildOpts {
    pub listen_addr: SocketAddr,
    pub recursors: Vec<SocketAddr>,
    pub domains: Arc<dyn DomainsSource>,
    pub on_changed: Option<DomainsChanged>,
    /// Start the multicast responder with this resolver
    pub mdns_resolver: Option<IpResolver>,
}

/// DNS server plus the domain table it routes through
pub struct DnsEngine {
    server: DnsServer,
    mux: Arc<DomainsMux>,
}

impl DnsEngine {
    #[must_use]
    pub fn build(opts: DnsBuildOpts) -> Self {
        let pool = Arc::new(FailoverRecursorPool::new(&opts.recursors));
        let forward = Arc::new(ForwardHandler::new(pool));

        let mut mux = DomainsMux::new(forward, opts.domains);
        if let Some(on_changed) = opts.on_changed {
            mux = mux.with_on_changed(on_changed);
        }
        let mux = Arc::new(mux);

        let mut server = DnsServer::new(opts.listen_addr, mux.clone());
        if let Some(resolver) = opts.mdns_resolver {
            server = server.with_mdns(Arc::new(MdnsServer::new(resolver)));
        }

        Self { server, mux }
    }

    /// Wire the engine from configuration
    ///
    /// Recursors fall back to resolv.conf, then to 8.8.8.8. Domain changes
    /// flush the OS DNS cache.
    ///
    /// # Errors
    ///
    /// Returns [`DnsError::ConfigError`] for unparsable recursors.
    pub fn from_config(config: &Config, exec: Arc<dyn CmdExecutor>) -> DnsResult<Self> {
        let cluster = &config.cluster;
        let directory: Arc<dyn ServiceDirectory> = if cluster.use_kubectl {
            Arc::new(KubectlServiceDirectory::new(exec.clone()))
        } else {
            Arc::new(StaticServiceDirectory::new(cluster.services.clone()))
        };
        let cluster_resolver = IpResolver::Cluster(Arc::new(ClusterResolver::new(
            &cluster.domain_suffix,
            directory,
        )));

        let mut recursors = config
            .dns
            .parsed_recursors()
            .map_err(|e| DnsError::config(e.to_string()))?;
        if recursors.is_empty() {
            recursors = ResolvConf::default().default_recursors();
        }

        let domains = ExecDomains::new(config.dns.map_exec.clone(), exec.clone())
            .with_static_map(&config.dns.map)
            .with_local_resolver(cluster_resolver.clone());

        let os_cache = Arc::new(OsDnsCache::new(exec));

        Ok(Self::build(DnsBuildOpts {
            listen_addr: config.dns.listen_addr,
            recursors,
            domains: Arc::new(domains),
            on_changed: Some(Arc::new(move || os_cache.flush())),
            mdns_resolver: config.dns.mdns.then_some(cluster_resolver),
        }))
    }

    /// Load the domain table, then serve until [`DnsEngine::shutdown`]
    ///
    /// # Errors
    ///
    /// Returns the server's error; see [`DnsServer::serve`].
    pub async fn serve(&self, started: oneshot::Sender<DnsAddrs>) -> DnsResult<()> {
        if let Err(e) = self.mux.update_once().await {
            warn!(error = %e, "Failed updating DNS domain handlers");
        }
        let refresh =
            tokio::spawn(Arc::clone(&self.mux).update_continuously(self.server.subscribe_shutdown()));

        let result = self.server.serve(started).await;
        refresh.abort();
        result
    }

    pub fn shutdown(&self) {
        self.server.shutdown();
    }
}
