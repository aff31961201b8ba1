//! Authoritative domains from configuration and external commands
//!
//! Each `map_exec` command runs under `bash -c` and prints a JSON object of
//! domain to IP list:
//!
//! ```json
//! {"app.test": ["127.0.0.1"], "db.test": ["10.0.0.5", "10.0.0.6"]}
//! ```
//!
//! Later commands override earlier ones for the same domain, static `map`
//! entries override both, and `local.` always maps to the cluster resolver.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::error::{DnsError, DnsResult};
use super::mdns::MDNS_DOMAIN;
use super::mux::DomainsSource;
use super::resolver::IpResolver;
use crate::forwarder::CmdExecutor;

/// Domains from `map_exec` commands, the static map and the cluster resolver
pub struct ExecDomains {
    cmds: Vec<String>,
    static_map: BTreeMap<String, IpResolver>,
    local: Option<IpResolver>,
    exec: Arc<dyn CmdExecutor>,
}

impl ExecDomains {
    pub fn new(cmds: Vec<String>, exec: Arc<dyn CmdExecutor>) -> Self {
        Self {
            cmds,
            static_map: BTreeMap::new(),
            local: None,
            exec,
        }
    }

    /// Static `domain -> IPs` entries
    #[must_use]
    pub fn with_static_map(mut self, map: &BTreeMap<String, Vec<IpAddr>>) -> Self {
        self.static_map = map
            .iter()
            .map(|(domain, ips)| (domain.clone(), IpResolver::StaticIps(ips.clone())))
            .collect();
        self
    }

    /// Resolver answering `local.` names
    #[must_use]
    pub fn with_local_resolver(mut self, resolver: IpResolver) -> Self {
        self.local = Some(resolver);
        self
    }

    fn run_all(cmds: &[String], exec: &dyn CmdExecutor) -> DnsResult<BTreeMap<String, Vec<String>>> {
        let mut domain_to_ips = BTreeMap::new();

        for cmd in cmds {
            let args = ["-c".to_string(), cmd.clone()];
            let out = exec.output("bash", &args).map_err(|e| {
                DnsError::config(format!("Executing DNS map-exec '{cmd}': {e}"))
            })?;

            let parsed: BTreeMap<String, Vec<String>> = serde_json::from_str(&out).map_err(|e| {
                DnsError::config(format!("Unmarshaling DNS map-exec '{cmd}' output: {e}"))
            })?;
            domain_to_ips.extend(parsed);
        }

        Ok(domain_to_ips)
    }
}

#[async_trait]
impl DomainsSource for ExecDomains {
    async fn domains(&self) -> DnsResult<BTreeMap<String, IpResolver>> {
        let cmds = self.cmds.clone();
        let exec = Arc::clone(&self.exec);
        let domain_to_ips = tokio::task::spawn_blocking(move || Self::run_all(&cmds, exec.as_ref()))
            .await
            .map_err(|e| DnsError::internal(format!("map-exec task: {e}")))??;

        let mut result = BTreeMap::new();
        for (domain, ip_strs) in domain_to_ips {
            let ips = ip_strs
                .iter()
                .map(|s| {
                    s.parse::<IpAddr>().map_err(|_| {
                        DnsError::config(format!("Unmarshaling DNS map-exec IP '{s}'"))
                    })
                })
                .collect::<DnsResult<Vec<_>>>()?;
            result.insert(domain, IpResolver::StaticIps(ips));
        }

        result.extend(self.static_map.clone());

        if let Some(local) = &self.local {
            result.insert(MDNS_DOMAIN.to_string(), local.clone());
        }

        debug!(count = result.len(), "Fetched DNS domains");
        Ok(result)
    }
}
