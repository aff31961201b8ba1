//! IP resolvers behind authoritative domains

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;

use super::cluster::ClusterResolver;
use super::error::{DnsError, DnsResult};

/// Outcome of a resolution attempt
///
/// `resolved == false` means the resolver does not own the name; the caller
/// may try another one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    pub ips: Vec<IpAddr>,
    pub resolved: bool,
}

impl Resolution {
    #[must_use]
    pub fn resolved(ips: Vec<IpAddr>) -> Self {
        Self {
            ips,
            resolved: true,
        }
    }

    #[must_use]
    pub fn unresolved() -> Self {
        Self::default()
    }
}

/// Every resolver a domain can be mapped to
#[derive(Clone)]
pub enum IpResolver {
    /// One fixed address for every name
    Static(IpAddr),
    /// A fixed address list for every name
    StaticIps(Vec<IpAddr>),
    /// Cluster service and pod names
    Cluster(Arc<ClusterResolver>),
    /// First resolver that claims the name
    Multi(Vec<IpResolver>),
}

impl IpResolver {
    /// Resolve `question` to IPv4 addresses
    ///
    /// # Errors
    ///
    /// Returns [`DnsError::ResolveError`] if the name is owned but cannot be
    /// resolved, or when no `Multi` member claims it.
    pub fn resolve_ipv4<'a>(&'a self, question: &'a str) -> BoxFuture<'a, DnsResult<Resolution>> {
        async move {
            match self {
                Self::Static(ip) => Ok(Resolution::resolved(vec![*ip])),
                Self::StaticIps(ips) => Ok(Resolution::resolved(ips.clone())),
                Self::Cluster(cluster) => cluster.resolve_ipv4(question).await,
                Self::Multi(resolvers) => {
                    for resolver in resolvers {
                        let result = resolver.resolve_ipv4(question).await;
                        if result.as_ref().map_or(true, |r| r.resolved) {
                            return result;
                        }
                    }
                    Err(DnsError::resolve(question, "Could not resolve IPv4"))
                }
            }
        }
        .boxed()
    }

    /// Resolve `question` to IPv6 addresses
    ///
    /// IPv6 is recognized but never answered: owned names resolve to an empty
    /// list.
    ///
    /// # Errors
    ///
    /// Same as [`IpResolver::resolve_ipv4`].
    pub fn resolve_ipv6<'a>(&'a self, question: &'a str) -> BoxFuture<'a, DnsResult<Resolution>> {
        async move {
            match self {
                Self::Static(_) | Self::StaticIps(_) => Ok(Resolution::resolved(Vec::new())),
                Self::Cluster(cluster) => cluster.resolve_ipv6(question),
                Self::Multi(resolvers) => {
                    for resolver in resolvers {
                        let result = resolver.resolve_ipv6(question).await;
                        if result.as_ref().map_or(true, |r| r.resolved) {
                            return result;
                        }
                    }
                    Err(DnsError::resolve(question, "Could not resolve IPv6"))
                }
            }
        }
        .boxed()
    }
}

impl fmt::Display for IpResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Static(ip) => write!(f, "{ip}"),
            Self::StaticIps(ips) => {
                let ips: Vec<String> = ips.iter().map(ToString::to_string).collect();
                write!(f, "[{}]", ips.join(", "))
            }
            Self::Cluster(cluster) => write!(f, "cluster({})", cluster.suffix()),
            Self::Multi(resolvers) => {
                let names: Vec<String> = resolvers.iter().map(ToString::to_string).collect();
                write!(f, "multi({})", names.join(", "))
            }
        }
    }
}

impl fmt::Debug for IpResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IpResolver({self})")
    }
}
