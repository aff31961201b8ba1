//! kwt-net: user-space network bridge into a remote cluster network
//!
//! This crate lets a workstation reach subnets and DNS names that only exist
//! inside a remote network. Kernel redirection rules send matching traffic
//! to local proxies, which recover each connection's original destination
//! and relay it through a reconnecting SSH tunnel. A local DNS server
//! answers cluster names and forwards everything else upstream.
//!
//! # Architecture
//!
//! ```text
//! app ──> iptables / pf redirect ──> TcpProxy ──> original_dst()
//!                                        |
//!                                        v
//!                             ReconnectingTunnel (SSH) ──> remote dst
//!
//! app DNS query ──> redirect :53 ──> DnsServer ──> DomainsMux ──> handlers
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use kwt_net::config::load_config;
//! use kwt_net::dns::DnsEngine;
//! use kwt_net::forwarder::{Factory, OsCmdExecutor};
//! use kwt_net::origdst::new_original_dst_resolver;
//! use kwt_net::session::{ForwardingProxy, RemotingProxy};
//! use kwt_net::subnets::{ConfiguredSubnets, ResolvConfDnsIps};
//! use kwt_net::tunnel::StaticSshEntryPoint;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = load_config("/etc/kwt-net/config.json")?;
//! let dns = DnsEngine::from_config(&config, Arc::new(OsCmdExecutor))?;
//! let forwarding = ForwardingProxy::new(
//!     Arc::new(Factory::new(0)),
//!     new_original_dst_resolver()?,
//!     Arc::new(dns),
//! );
//!
//! let ssh = config.ssh.as_ref().ok_or("ssh section required")?;
//! let proxy = RemotingProxy::new(
//!     Arc::new(StaticSshEntryPoint::from_config(ssh)?),
//!     Arc::new(ConfiguredSubnets::new(config.subnets.clone())),
//!     Arc::new(ResolvConfDnsIps::default()),
//!     forwarding,
//! );
//! proxy.serve().await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`config`]: Configuration types and loading
//! - [`dns`]: DNS resolution engine and mDNS responder
//! - [`error`]: Error types
//! - [`forwarder`]: Redirection rules (iptables, pfctl)
//! - [`origdst`]: Original destination lookup
//! - [`pf`]: macOS packet filter device access
//! - [`proxy`]: TCP relay and UDP placeholder
//! - [`session`]: Session orchestration
//! - [`subnets`]: Subnet guessing and DNS IP discovery
//! - [`tunnel`]: SSH tunnel transport with reconnect

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod config;
pub mod dns;
pub mod error;
pub mod forwarder;
pub mod ifaces;
pub mod origdst;
pub mod pf;
pub mod proxy;
pub mod session;
pub mod subnets;
pub mod tunnel;

// Re-export commonly used types at the crate root
pub use config::{Config, DnsConfig, SshConfig};
pub use dns::{DnsEngine, DnsError, DnsServer, IpResolver};
pub use error::{
    ConfigError, ForwarderError, KwtNetError, OrigDstError, PfError, ProxyError, SessionError,
    TunnelError,
};
pub use forwarder::{Factory, Forwarder, ForwarderFactory, LockingForwarder};
pub use session::{DnsOnlyProxy, ForwardingProxy, ListenProxy, RemotingProxy};
pub use subnets::{guess_subnets, ConfiguredSubnets, KubeSubnets, Subnets};
pub use tunnel::{Dialer, EntryPoint, ReconnectingTunnel, StaticSshEntryPoint};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Check if running as root (effective UID = 0)
#[must_use]
pub fn is_root() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail
    unsafe { libc::geteuid() == 0 }
}
