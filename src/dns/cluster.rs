//! Cluster-internal DNS names
//!
//! Two name shapes are understood under the cluster suffix:
//!
//! ```text
//! <service>.<namespace>.svc.<suffix>      -> service cluster IP
//! <a-b-c-d>.<namespace>.pod.<suffix>      -> a.b.c.d
//! ```

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use super::error::{DnsError, DnsResult};
use super::resolver::Resolution;
use crate::forwarder::CmdExecutor;

/// Default cluster domain
pub const DEFAULT_CLUSTER_SUFFIX: &str = "cluster.local.";

/// Looks up service cluster IPs
#[async_trait]
pub trait ServiceDirectory: Send + Sync {
    /// Cluster IP of `namespace/name`; `None` for headless services
    ///
    /// # Errors
    ///
    /// Returns [`DnsError::ResolveError`] if the service cannot be fetched.
    async fn cluster_ip(&self, namespace: &str, name: &str) -> DnsResult<Option<IpAddr>>;
}

/// Fixed `namespace/name -> IP` table
#[derive(Debug, Clone, Default)]
pub struct StaticServiceDirectory {
    services: BTreeMap<String, IpAddr>,
}

impl StaticServiceDirectory {
    #[must_use]
    pub const fn new(services: BTreeMap<String, IpAddr>) -> Self {
        Self { services }
    }
}

#[async_trait]
impl ServiceDirectory for StaticServiceDirectory {
    async fn cluster_ip(&self, namespace: &str, name: &str) -> DnsResult<Option<IpAddr>> {
        let key = format!("{namespace}/{name}");
        self.services
            .get(&key)
            .copied()
            .map(Some)
            .ok_or_else(|| DnsError::resolve(key, "Getting service: not found"))
    }
}

#[derive(Deserialize)]
struct KubeService {
    spec: KubeServiceSpec,
}

#[derive(Deserialize)]
struct KubeServiceSpec {
    #[serde(default, rename = "clusterIP")]
    cluster_ip: String,
}

/// Asks `kubectl` for each service
pub struct KubectlServiceDirectory {
    exec: Arc<dyn CmdExecutor>,
}

impl KubectlServiceDirectory {
    pub fn new(exec: Arc<dyn CmdExecutor>) -> Self {
        Self { exec }
    }

    fn parse_cluster_ip(key: &str, output: &str) -> DnsResult<Option<IpAddr>> {
        let svc: KubeService = serde_json::from_str(output)
            .map_err(|e| DnsError::resolve(key, format!("Getting service: {e}")))?;

        match svc.spec.cluster_ip.as_str() {
            "" | "None" => Ok(None),
            ip => ip.parse().map(Some).map_err(|_| {
                DnsError::resolve(key, "Expected service cluster IP address to be valid")
            }),
        }
    }
}

#[async_trait]
impl ServiceDirectory for KubectlServiceDirectory {
    async fn cluster_ip(&self, namespace: &str, name: &str) -> DnsResult<Option<IpAddr>> {
        let key = format!("{namespace}/{name}");
        let args: Vec<String> = ["get", "service", name, "-n", namespace, "-o", "json"]
            .iter()
            .map(|s| (*s).to_string())
            .collect();

        let exec = self.exec.clone();
        let output = tokio::task::spawn_blocking(move || exec.output("kubectl", &args))
            .await
            .map_err(|e| DnsError::internal(format!("kubectl task: {e}")))?
            .map_err(|e| DnsError::resolve(&key, format!("Getting service: {e}")))?;

        Self::parse_cluster_ip(&key, &output)
    }
}

/// Resolves service and pod names under a cluster suffix
pub struct ClusterResolver {
    suffix: String,
    svc_suffix: String,
    pod_suffix: String,
    directory: Arc<dyn ServiceDirectory>,
}

impl ClusterResolver {
    /// `suffix` is the cluster domain, e.g. `cluster.local.`
    pub fn new(suffix: &str, directory: Arc<dyn ServiceDirectory>) -> Self {
        let suffix = normalize(suffix);
        Self {
            svc_suffix: format!(".svc.{suffix}"),
            pod_suffix: format!(".pod.{suffix}"),
            suffix,
            directory,
        }
    }

    /// Cluster domain this resolver owns
    #[must_use]
    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    fn owns(&self, question: &str) -> bool {
        question.ends_with(&format!(".{}", self.suffix))
    }

    /// # Errors
    ///
    /// Returns [`DnsError::ResolveError`] for owned names of an unknown
    /// shape or services that cannot be looked up.
    pub async fn resolve_ipv4(&self, question: &str) -> DnsResult<Resolution> {
        let question = normalize(question);
        if !self.owns(&question) {
            return Ok(Resolution::unresolved());
        }

        if let Some(rest) = question.strip_suffix(&self.svc_suffix) {
            let (name, namespace) = rest.split_once('.').ok_or_else(|| {
                DnsError::resolve(&question, "Expected service address to be in particular format")
            })?;
            let ip = self.directory.cluster_ip(namespace, name).await?;
            debug!(question = %question, ip = ?ip, "Resolved service");
            return Ok(Resolution::resolved(ip.into_iter().collect()));
        }

        if let Some(rest) = question.strip_suffix(&self.pod_suffix) {
            let (dashed, _namespace) = rest.split_once('.').ok_or_else(|| {
                DnsError::resolve(&question, "Expected pod address to be in particular format")
            })?;
            let ip: IpAddr = dashed.replace('-', ".").parse().map_err(|_| {
                DnsError::resolve(&question, "Expected pod address to be in IP address format")
            })?;
            return Ok(Resolution::resolved(vec![ip]));
        }

        Err(DnsError::resolve(
            question,
            "Could not determine Kubernetes DNS question format",
        ))
    }

    /// Owned names of a known shape resolve to no IPv6 addresses
    ///
    /// # Errors
    ///
    /// Returns [`DnsError::ResolveError`] for owned names of an unknown shape.
    pub fn resolve_ipv6(&self, question: &str) -> DnsResult<Resolution> {
        let question = normalize(question);
        if !self.owns(&question) {
            return Ok(Resolution::unresolved());
        }
        if question.ends_with(&self.svc_suffix) || question.ends_with(&self.pod_suffix) {
            return Ok(Resolution::resolved(Vec::new()));
        }
        Err(DnsError::resolve(
            question,
            "Could not determine Kubernetes DNS question format",
        ))
    }
}

/// Lowercase and make fully qualified
pub(crate) fn normalize(name: &str) -> String {
    let mut name = name.to_ascii_lowercase();
    if !name.ends_with('.') {
        name.push('.');
    }
    name
}

/// `web.default.svc.cluster.local` for service `web` in `default`
#[must_use]
pub fn service_internal_dns_address(name: &str, namespace: &str) -> String {
    format!("{name}.{namespace}.svc.{DEFAULT_CLUSTER_SUFFIX}")
        .trim_end_matches('.')
        .to_string()
}

/// `10-0-0-5.default.pod.cluster.local` for a pod at 10.0.0.5; `None` while
/// the pod has no IP
#[must_use]
pub fn pod_internal_dns_address(pod_ip: &str, namespace: &str) -> Option<String> {
    if pod_ip.is_empty() {
        return None;
    }
    let dashed = pod_ip.replace('.', "-");
    Some(
        format!("{dashed}.{namespace}.pod.{DEFAULT_CLUSTER_SUFFIX}")
            .trim_end_matches('.')
            .to_string(),
    )
}
