//! Kernel packet redirection
//!
//! A [`Forwarder`] installs the NAT rules that send traffic for the forwarded
//! subnets and DNS servers to the local proxies, and removes them again.
//!
//! # Drivers
//!
//! - [`Iptables`]: Linux, two NAT chains hooked into `OUTPUT` and `PREROUTING`
//! - [`Pfctl`]: macOS, a named pf anchor plus `/dev/pf` anchor references
//!
//! Every driver names its rule set after the TCP proxy port
//! (`kwt-tcp-<port>`), so rules from a crashed session can be found and
//! removed by a later one using the same port.
//!
//! `reset` is safe to call repeatedly and keeps going when a step fails.

pub(crate) mod cmd;
mod iptables;
mod locking;
mod pfctl;

use std::net::IpAddr;
use std::sync::Arc;

use ipnet::IpNet;

use crate::error::ForwarderError;
use crate::pf::DeviceAnchors;

pub use cmd::{describe, CmdExecutor, OsCmdExecutor};
pub use iptables::{Iptables, SKIP_TTL};
pub use locking::LockingForwarder;
pub use pfctl::Pfctl;

/// Installs and removes redirection rules
pub trait Forwarder: Send {
    /// Confirm the firewall tool can be used before anything is installed
    ///
    /// # Errors
    ///
    /// Returns [`ForwarderError::Prerequisite`] if the tool is unusable.
    fn check_prereqs(&self) -> Result<(), ForwarderError>;

    /// Redirect TCP traffic to `subnets` and port 53 traffic to `dns_ips`
    ///
    /// # Errors
    ///
    /// Returns the first failing step; already installed rules stay in
    /// place until [`Forwarder::reset`].
    fn add(&mut self, subnets: &[IpNet], dns_ips: &[IpAddr]) -> Result<(), ForwarderError>;

    /// Remove everything `add` installed
    ///
    /// # Errors
    ///
    /// Returns every failed step after attempting all of them.
    fn reset(&mut self) -> Result<(), ForwarderError>;
}

/// Ports and exclusions a forwarder redirects with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwarderOpts {
    /// TCP proxy port
    pub dst_tcp_port: u16,
    /// DNS server TCP port
    pub dst_dns_tcp_port: u16,
    /// DNS server UDP port
    pub dst_dns_udp_port: u16,
    /// Traffic from this group is never redirected
    pub process_group_id: u32,
}

impl ForwarderOpts {
    /// Deterministic name of this session's rule set
    #[must_use]
    pub fn rule_set_name(&self) -> String {
        format!("kwt-tcp-{}", self.dst_tcp_port)
    }
}

/// Builds a forwarder once the proxies have bound their ports
pub trait ForwarderFactory: Send + Sync {
    /// # Errors
    ///
    /// Returns [`ForwarderError`] if no driver can be built.
    fn new_forwarder(
        &self,
        dst_tcp_port: u16,
        dst_dns_tcp_port: u16,
        dst_dns_udp_port: u16,
    ) -> Result<Box<dyn Forwarder>, ForwarderError>;
}

/// Creates the forwarder for the running OS
#[derive(Debug, Clone, Copy)]
pub struct Factory {
    process_group_id: u32,
}

impl Factory {
    #[must_use]
    pub const fn new(process_group_id: u32) -> Self {
        Self { process_group_id }
    }
}

impl ForwarderFactory for Factory {
    /// Build the platform driver for the given proxy ports
    ///
    /// Fails with [`ForwarderError::UnsupportedOs`] outside Linux and macOS.
    fn new_forwarder(
        &self,
        dst_tcp_port: u16,
        dst_dns_tcp_port: u16,
        dst_dns_udp_port: u16,
    ) -> Result<Box<dyn Forwarder>, ForwarderError> {
        let opts = ForwarderOpts {
            dst_tcp_port,
            dst_dns_tcp_port,
            dst_dns_udp_port,
            process_group_id: self.process_group_id,
        };

        match std::env::consts::OS {
            "linux" => Ok(Box::new(Iptables::new(opts, Arc::new(OsCmdExecutor)))),
            "macos" => Ok(Box::new(Pfctl::new(
                opts,
                Arc::new(OsCmdExecutor),
                Arc::new(DeviceAnchors),
            ))),
            other => Err(ForwarderError::UnsupportedOs(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_set_name() {
        let opts = ForwarderOpts {
            dst_tcp_port: 40123,
            dst_dns_tcp_port: 1,
            dst_dns_udp_port: 2,
            process_group_id: 0,
        };
        assert_eq!(opts.rule_set_name(), "kwt-tcp-40123");
    }

    #[test]
    fn test_factory_for_current_os() {
        let result = Factory::new(0).new_forwarder(1, 2, 3);
        if cfg!(any(target_os = "linux", target_os = "macos")) {
            assert!(result.is_ok());
        } else {
            assert!(matches!(result, Err(ForwarderError::UnsupportedOs(_))));
        }
    }
}
