//! Which subnets and DNS IPs a session intercepts
//!
//! Subnets are either configured as CIDRs or guessed from IPs known to live
//! in the remote network. Guessing picks the widest of /14, /16 and /24 that
//! does not swallow any local interface address:
//!
//! ```text
//! remote 10.200.37.33, local 10.80.130.76
//!   /14 -> 10.200.0.0 - 10.203.255.255   no local IP inside, accepted
//! ```

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use ipnet::{IpNet, Ipv4Net};
use serde::Deserialize;
use tracing::debug;

use crate::dns::ResolvConf;
use crate::error::{ConfigError, KwtNetError, Result, SessionError};
use crate::forwarder::CmdExecutor;
use crate::ifaces;

/// Candidate prefix lengths, widest first
const GUESS_PREFIXES: [u8; 3] = [14, 16, 24];

/// Source of the subnets to forward
#[async_trait]
pub trait Subnets: Send + Sync {
    /// # Errors
    ///
    /// Returns an error if the subnets cannot be determined.
    async fn subnets(&self) -> Result<Vec<IpNet>>;
}

/// Source of the DNS server IPs whose port 53 traffic is intercepted
#[async_trait]
pub trait DnsIps: Send + Sync {
    /// # Errors
    ///
    /// Returns an error if the IPs cannot be determined.
    async fn dns_ips(&self) -> Result<Vec<IpAddr>>;
}

// ============================================================================
// Guessing
// ============================================================================

/// Guess subnets covering `remote_ips` that contain none of `excluded_ips`
///
/// Each returned net keeps the remote IP it was derived from as its address,
/// so `10.200.37.33/14` stays `10.200.37.33/14`. IPv6 remote IPs are skipped.
#[must_use]
pub fn guess_subnets(remote_ips: &[IpAddr], excluded_ips: &[IpAddr]) -> Vec<IpNet> {
    let remote_v4: Vec<Ipv4Addr> = remote_ips
        .iter()
        .filter_map(|ip| match ip {
            IpAddr::V4(v4) => Some(*v4),
            IpAddr::V6(_) => None,
        })
        .collect();

    let mut candidates: Vec<Ipv4Net> = remote_v4
        .iter()
        .filter_map(|remote| {
            GUESS_PREFIXES.iter().find_map(|&prefix| {
                let net = Ipv4Net::new(*remote, prefix).ok()?;
                let overlaps_local = excluded_ips.iter().any(|ip| match ip {
                    IpAddr::V4(v4) => net.contains(v4),
                    IpAddr::V6(_) => false,
                });
                (!overlaps_local).then_some(net)
            })
        })
        .collect();

    // Stable, so equally sized candidates keep remote IP order
    candidates.sort_by_key(Ipv4Net::prefix_len);

    let mut selected_idx = Vec::new();
    for remote in &remote_v4 {
        if let Some(idx) = candidates.iter().position(|net| net.contains(remote)) {
            if !selected_idx.contains(&idx) {
                selected_idx.push(idx);
            }
        }
    }

    selected_idx
        .into_iter()
        .map(|idx| IpNet::V4(candidates[idx]))
        .collect()
}

/// Comma separated subnets for logging
#[must_use]
pub fn subnets_as_string(subnets: &[IpNet]) -> String {
    subnets
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

// ============================================================================
// Providers
// ============================================================================

/// Subnets given as CIDR strings
#[derive(Debug, Clone)]
pub struct ConfiguredSubnets {
    subnets: Vec<String>,
}

impl ConfiguredSubnets {
    pub fn new(subnets: Vec<String>) -> Self {
        Self { subnets }
    }
}

#[async_trait]
impl Subnets for ConfiguredSubnets {
    async fn subnets(&self) -> Result<Vec<IpNet>> {
        self.subnets
            .iter()
            .map(|s| {
                s.parse::<IpNet>().map(|net| net.trunc()).map_err(|e| {
                    KwtNetError::from(ConfigError::ValidationError(format!(
                        "Invalid subnet '{s}': {e}"
                    )))
                })
            })
            .collect()
    }
}

/// Subnets guessed from a fixed list of remote IPs
#[derive(Debug, Clone)]
pub struct GuessedSubnets {
    remote_ips: Vec<IpAddr>,
}

impl GuessedSubnets {
    pub fn new(remote_ips: Vec<IpAddr>) -> Self {
        Self { remote_ips }
    }
}

#[async_trait]
impl Subnets for GuessedSubnets {
    async fn subnets(&self) -> Result<Vec<IpNet>> {
        Ok(guess_subnets(&self.remote_ips, &local_ips()?))
    }
}

fn local_ips() -> Result<Vec<IpAddr>> {
    let ips = ifaces::local_ipv4s()
        .map_err(|e| SessionError::component("Fetching local interface addrs", e))?;
    Ok(ips.into_iter().map(IpAddr::V4).collect())
}

#[derive(Debug, Default, Deserialize)]
struct KubeList {
    #[serde(default)]
    items: Vec<KubeItem>,
}

#[derive(Debug, Default, Deserialize)]
struct KubeItem {
    #[serde(default)]
    kind: String,
    #[serde(default)]
    status: KubeStatus,
    #[serde(default)]
    spec: KubeSpec,
}

#[derive(Debug, Default, Deserialize)]
struct KubeStatus {
    #[serde(default, rename = "podIP")]
    pod_ip: String,
}

#[derive(Debug, Default, Deserialize)]
struct KubeSpec {
    #[serde(default, rename = "clusterIP")]
    cluster_ip: String,
}

/// Subnets guessed from every pod and service IP in the cluster
#[derive(Clone)]
pub struct KubeSubnets {
    exec: Arc<dyn CmdExecutor>,
    additional_remote_ips: Vec<IpAddr>,
}

impl KubeSubnets {
    pub fn new(exec: Arc<dyn CmdExecutor>, additional_remote_ips: Vec<IpAddr>) -> Self {
        Self {
            exec,
            additional_remote_ips,
        }
    }

    fn remote_ips(&self) -> Result<Vec<IpAddr>> {
        let started = Instant::now();

        let args: Vec<String> = ["get", "pods,svc", "-A", "-o", "json"]
            .iter()
            .map(ToString::to_string)
            .collect();
        let out = self
            .exec
            .output("kubectl", &args)
            .map_err(|e| SessionError::component("Listing pods and services", e))?;

        let list: KubeList = serde_json::from_str(&out)
            .map_err(|e| SessionError::component("Parsing pods and services", e))?;

        let (pod_ips, svc_ips) = parse_kube_ips(&list);
        debug!(
            pods = pod_ips.len(),
            services = svc_ips.len(),
            elapsed = ?started.elapsed(),
            "Finished fetching pods and services"
        );

        let mut remote_ips = pod_ips;
        remote_ips.extend(svc_ips);
        remote_ips.extend(self.additional_remote_ips.iter().copied());
        Ok(remote_ips)
    }
}

/// Pod IPs and service cluster IPs; headless ("None") and empty ones are skipped
fn parse_kube_ips(list: &KubeList) -> (Vec<IpAddr>, Vec<IpAddr>) {
    let mut pod_ips = Vec::new();
    let mut svc_ips = Vec::new();

    for item in &list.items {
        match item.kind.as_str() {
            "Pod" => pod_ips.extend(item.status.pod_ip.parse::<IpAddr>().ok()),
            "Service" => svc_ips.extend(item.spec.cluster_ip.parse::<IpAddr>().ok()),
            _ => {}
        }
    }

    (pod_ips, svc_ips)
}

#[async_trait]
impl Subnets for KubeSubnets {
    async fn subnets(&self) -> Result<Vec<IpNet>> {
        let local_ips = local_ips()?;

        let this = self.clone();
        let remote_ips = tokio::task::spawn_blocking(move || this.remote_ips())
            .await
            .map_err(|e| SessionError::component("Listing pods and services", e))??;

        Ok(guess_subnets(&remote_ips, &local_ips))
    }
}

/// DNS IPs from resolv.conf nameserver entries
#[derive(Debug, Clone, Default)]
pub struct ResolvConfDnsIps {
    conf: ResolvConf,
}

impl ResolvConfDnsIps {
    pub fn new(conf: ResolvConf) -> Self {
        Self { conf }
    }
}

#[async_trait]
impl DnsIps for ResolvConfDnsIps {
    async fn dns_ips(&self) -> Result<Vec<IpAddr>> {
        Ok(self.conf.nameservers()?)
    }
}

/// Fixed DNS IPs
#[derive(Debug, Clone, Default)]
pub struct StaticDnsIps(pub Vec<IpAddr>);

#[async_trait]
impl DnsIps for StaticDnsIps {
    async fn dns_ips(&self) -> Result<Vec<IpAddr>> {
        Ok(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forwarder::cmd::fake::FakeCmdExecutor;
    use std::io::Write;

    fn ips(list: &[&str]) -> Vec<IpAddr> {
        list.iter().map(|s| s.parse().unwrap()).collect()
    }

    // ========================================================================
    // Guessing
    // ========================================================================

    #[test]
    fn test_guess_subnets_avoids_local_ips() {
        let subnets = guess_subnets(
            &ips(&["10.200.37.33", "10.100.200.141"]),
            &ips(&["10.80.130.76"]),
        );
        assert_eq!(
            subnets_as_string(&subnets),
            "10.200.37.33/14, 10.100.200.141/14"
        );
    }

    #[test]
    fn test_guess_subnets_merges_covered_ips() {
        let subnets = guess_subnets(&ips(&["10.200.37.33", "10.200.100.141"]), &[]);
        assert_eq!(subnets_as_string(&subnets), "10.200.37.33/14");
    }

    #[test]
    fn test_guess_subnets_narrows_around_local_ip() {
        // 10.0.5.1 is inside the /14 and /16 around 10.0.1.1
        let subnets = guess_subnets(&ips(&["10.0.1.1"]), &ips(&["10.0.5.1"]));
        assert_eq!(subnets_as_string(&subnets), "10.0.1.1/24");

        // Nothing fits when the local IP shares the /24
        let subnets = guess_subnets(&ips(&["10.0.1.1"]), &ips(&["10.0.1.2"]));
        assert!(subnets.is_empty());
    }

    #[test]
    fn test_guess_subnets_mixed_prefixes_keep_remote_order() {
        let subnets = guess_subnets(&ips(&["10.0.1.1", "10.4.0.1"]), &ips(&["10.0.5.1"]));
        assert_eq!(subnets_as_string(&subnets), "10.0.1.1/24, 10.4.0.1/14");
    }

    #[test]
    fn test_guess_subnets_skips_ipv6() {
        let subnets = guess_subnets(&ips(&["fd00::1"]), &[]);
        assert!(subnets.is_empty());
    }

    // ========================================================================
    // Providers
    // ========================================================================

    #[tokio::test]
    async fn test_configured_subnets() {
        let provider = ConfiguredSubnets::new(vec!["10.0.0.0/16".into(), "192.168.1.7/24".into()]);
        let subnets = provider.subnets().await.unwrap();
        assert_eq!(subnets_as_string(&subnets), "10.0.0.0/16, 192.168.1.0/24");

        let bad = ConfiguredSubnets::new(vec!["10.0.0.0".into()]);
        assert!(bad.subnets().await.is_err());
    }

    #[test]
    fn test_parse_kube_ips() {
        let list: KubeList = serde_json::from_str(
            r#"{"items": [
                {"kind": "Pod", "status": {"podIP": "10.8.0.4"}},
                {"kind": "Pod", "status": {}},
                {"kind": "Service", "spec": {"clusterIP": "10.11.240.1"}},
                {"kind": "Service", "spec": {"clusterIP": "None"}}
            ]}"#,
        )
        .unwrap();

        let (pods, svcs) = parse_kube_ips(&list);
        assert_eq!(pods, ips(&["10.8.0.4"]));
        assert_eq!(svcs, ips(&["10.11.240.1"]));
    }

    #[test]
    fn test_kube_remote_ips_include_additional() {
        let exec = Arc::new(FakeCmdExecutor::default());
        exec.set_output(
            "kubectl get pods,svc -A -o json",
            r#"{"items": [{"kind": "Pod", "status": {"podIP": "10.8.0.4"}}]}"#,
        );
        let provider = KubeSubnets::new(exec.clone(), ips(&["172.16.0.9"]));

        assert_eq!(provider.remote_ips().unwrap(), ips(&["10.8.0.4", "172.16.0.9"]));
        assert_eq!(exec.take_cmds().len(), 1);
    }

    #[test]
    fn test_kube_remote_ips_errors() {
        let exec = Arc::new(FakeCmdExecutor::default());
        exec.set_failure("kubectl get pods,svc -A -o json", "forbidden");
        let provider = KubeSubnets::new(exec.clone(), vec![]);
        let err = provider.remote_ips().unwrap_err();
        assert!(err.to_string().contains("Listing pods and services"));

        exec.failures.lock().clear();
        exec.set_output("kubectl get pods,svc -A -o json", "<html>");
        assert!(provider.remote_ips().is_err());
    }

    #[tokio::test]
    async fn test_resolv_conf_dns_ips() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "nameserver 10.0.0.2\nnameserver 10.0.0.3").unwrap();

        let provider = ResolvConfDnsIps::new(ResolvConf::new(file.path()));
        assert_eq!(provider.dns_ips().await.unwrap(), ips(&["10.0.0.2", "10.0.0.3"]));

        let missing = ResolvConfDnsIps::new(ResolvConf::new("/nonexistent/resolv.conf"));
        assert!(missing.dns_ips().await.is_err());
    }
}
