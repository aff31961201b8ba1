//! `nameserver` entries from resolv.conf
//!
//! These are the DNS IPs whose port-53 traffic gets intercepted, and the
//! default recursors when none are configured.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;

use super::error::{DnsError, DnsResult};

/// System resolver configuration
pub const RESOLV_CONF_PATH: &str = "/etc/resolv.conf";

/// Recursor used when nothing else is known
pub const FALLBACK_RECURSOR: SocketAddr =
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)), 53);

static NAMESERVER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*nameserver\s+(\S+)$").expect("valid nameserver regex"));

/// Reads nameservers from a resolv.conf file
#[derive(Debug, Clone)]
pub struct ResolvConf {
    path: PathBuf,
}

impl Default for ResolvConf {
    fn default() -> Self {
        Self::new(RESOLV_CONF_PATH)
    }
}

impl ResolvConf {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Nameserver IPs in file order; unparsable entries are skipped
    ///
    /// # Errors
    ///
    /// Returns [`DnsError::ConfigError`] if the file cannot be read.
    pub fn nameservers(&self) -> DnsResult<Vec<IpAddr>> {
        let contents = std::fs::read_to_string(&self.path)
            .map_err(|e| DnsError::config(format!("Reading DNS nameservers: {e}")))?;
        Ok(parse_nameservers(&contents))
    }

    /// Nameservers on port 53, or [`FALLBACK_RECURSOR`] if there are none
    #[must_use]
    pub fn default_recursors(&self) -> Vec<SocketAddr> {
        let recursors: Vec<SocketAddr> = self
            .nameservers()
            .unwrap_or_default()
            .into_iter()
            .map(|ip| SocketAddr::new(ip, 53))
            .collect();

        if recursors.is_empty() {
            vec![FALLBACK_RECURSOR]
        } else {
            recursors
        }
    }
}

/// Nameserver IPs found in resolv.conf text
#[must_use]
pub fn parse_nameservers(contents: &str) -> Vec<IpAddr> {
    contents
        .lines()
        .filter_map(|line| NAMESERVER_RE.captures(line))
        .filter_map(|caps| caps.get(1)?.as_str().parse().ok())
        .collect()
}
