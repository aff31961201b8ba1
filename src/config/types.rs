//! Configuration types for kwt-net
//!
//! This module defines all configuration structures used by the bridge.
//! Configuration is loaded from JSON files, merged with command-line flags
//! in `main`, and validated before a session starts.

use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Subnets to forward (e.g. "10.0.0.0/16"); guessed when empty
    #[serde(default)]
    pub subnets: Vec<String>,

    /// Additional remote IPs used for subnet guessing
    #[serde(default)]
    pub remote_ips: Vec<String>,

    /// Group id whose traffic is never intercepted (defaults to our egid)
    #[serde(default)]
    pub process_group_id: Option<u32>,

    /// DNS engine configuration
    #[serde(default)]
    pub dns: DnsConfig,

    /// SSH entry point; required unless running DNS only
    #[serde(default)]
    pub ssh: Option<SshConfig>,

    /// Cluster name resolution
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Reverse forwards: remote listener to local address
    #[serde(default)]
    pub listen: Vec<ListenForwardConfig>,

    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
}

impl Config {
    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if validation fails.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for subnet in &self.subnets {
            subnet.parse::<IpNet>().map_err(|e| {
                ConfigError::ValidationError(format!("Invalid subnet '{subnet}': {e}"))
            })?;
        }

        for ip in &self.remote_ips {
            ip.parse::<IpAddr>().map_err(|e| {
                ConfigError::ValidationError(format!("Invalid remote IP '{ip}': {e}"))
            })?;
        }

        self.dns.validate()?;
        self.cluster.validate()?;
        self.log.validate()?;

        if let Some(ssh) = &self.ssh {
            ssh.validate()?;
        }

        for forward in &self.listen {
            forward.validate()?;
        }

        Ok(())
    }

    /// Create a minimal default configuration
    #[must_use]
    pub fn default_config() -> Self {
        Self::default()
    }

    /// Parsed remote IPs
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` on an unparsable address.
    pub fn parsed_remote_ips(&self) -> Result<Vec<IpAddr>, ConfigError> {
        self.remote_ips
            .iter()
            .map(|s| {
                s.parse::<IpAddr>().map_err(|e| {
                    ConfigError::ValidationError(format!("Invalid remote IP '{s}': {e}"))
                })
            })
            .collect()
    }
}

/// DNS engine configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DnsConfig {
    /// Upstream recursors ("ip" or "ip:port"); read from resolv.conf when empty
    #[serde(default)]
    pub recursors: Vec<String>,

    /// Static domain to IP mappings
    #[serde(default)]
    pub map: BTreeMap<String, Vec<IpAddr>>,

    /// Shell commands printing a JSON object of domain to IP list
    #[serde(default)]
    pub map_exec: Vec<String>,

    /// Start the multicast DNS responder for `.local`
    #[serde(default)]
    pub mdns: bool,

    /// Address the DNS server binds (TCP and UDP)
    #[serde(default = "default_dns_listen_addr")]
    pub listen_addr: SocketAddr,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            recursors: Vec::new(),
            map: BTreeMap::new(),
            map_exec: Vec::new(),
            mdns: false,
            listen_addr: default_dns_listen_addr(),
        }
    }
}

impl DnsConfig {
    /// Validate DNS configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` for unparsable recursors or
    /// empty mapping entries.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for recursor in &self.recursors {
            parse_recursor(recursor)?;
        }

        for (domain, ips) in &self.map {
            if domain.trim().is_empty() {
                return Err(ConfigError::ValidationError(
                    "DNS map domain cannot be empty".into(),
                ));
            }
            if ips.is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "DNS map entry '{domain}' has no IPs"
                )));
            }
        }

        if self.map_exec.iter().any(|cmd| cmd.trim().is_empty()) {
            return Err(ConfigError::ValidationError(
                "DNS map exec command cannot be empty".into(),
            ));
        }

        Ok(())
    }

    /// Parsed recursor addresses, in configured order
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` on an unparsable entry.
    pub fn parsed_recursors(&self) -> Result<Vec<SocketAddr>, ConfigError> {
        self.recursors.iter().map(|r| parse_recursor(r)).collect()
    }
}

/// Parse "ip" or "ip:port" into a socket address, defaulting to port 53
///
/// # Errors
///
/// Returns `ConfigError::ValidationError` if neither form parses.
pub fn parse_recursor(value: &str) -> Result<SocketAddr, ConfigError> {
    if let Ok(addr) = value.parse::<SocketAddr>() {
        return Ok(addr);
    }
    value
        .parse::<IpAddr>()
        .map(|ip| SocketAddr::new(ip, 53))
        .map_err(|_| ConfigError::ValidationError(format!("Invalid DNS recursor '{value}'")))
}

/// SSH entry point configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SshConfig {
    /// Remote user
    pub user: String,

    /// Remote host as "host:port"
    pub host: String,

    /// Private key as PEM text, or a path to a PEM file
    pub private_key: String,

    /// Expected host key (base64 body of an OpenSSH public key)
    #[serde(default)]
    pub host_public_key: Option<String>,

    /// Keepalive interval in seconds
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
}

impl SshConfig {
    /// Validate SSH configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` on empty fields.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.user.is_empty() {
            return Err(ConfigError::ValidationError("SSH user cannot be empty".into()));
        }
        if self.host.is_empty() {
            return Err(ConfigError::ValidationError("SSH host cannot be empty".into()));
        }
        if !self.host.contains(':') {
            return Err(ConfigError::ValidationError(format!(
                "SSH host '{}' must include a port",
                self.host
            )));
        }
        if self.private_key.is_empty() {
            return Err(ConfigError::ValidationError(
                "SSH private key cannot be empty".into(),
            ));
        }
        if self.keepalive_secs == 0 {
            return Err(ConfigError::ValidationError(
                "SSH keepalive interval must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Cluster-internal name resolution
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClusterConfig {
    /// Cluster domain suffix, fully qualified
    #[serde(default = "default_cluster_suffix")]
    pub domain_suffix: String,

    /// Known services as "namespace/name" to cluster IP
    #[serde(default)]
    pub services: BTreeMap<String, IpAddr>,

    /// Look up services and remote IPs with kubectl
    #[serde(default)]
    pub use_kubectl: bool,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            domain_suffix: default_cluster_suffix(),
            services: BTreeMap::new(),
            use_kubectl: false,
        }
    }
}

impl ClusterConfig {
    /// Validate cluster configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` for a suffix that is not
    /// fully qualified or a malformed service key.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.domain_suffix.ends_with('.') || self.domain_suffix.len() < 2 {
            return Err(ConfigError::ValidationError(format!(
                "Cluster domain suffix '{}' must be fully qualified",
                self.domain_suffix
            )));
        }
        for key in self.services.keys() {
            match key.split_once('/') {
                Some((ns, name)) if !ns.is_empty() && !name.is_empty() => {}
                _ => {
                    return Err(ConfigError::ValidationError(format!(
                        "Service key '{key}' must be 'namespace/name'"
                    )))
                }
            }
        }
        Ok(())
    }
}

/// One reverse forward
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ListenForwardConfig {
    /// Remote listen address as "host:port"
    pub remote: String,

    /// Local address accepted connections are relayed to
    pub local: SocketAddr,
}

impl ListenForwardConfig {
    /// Validate a reverse forward
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` when the remote address has no port.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.remote.rsplit_once(':') {
            Some((_, port)) if port.parse::<u16>().is_ok() => Ok(()),
            _ => Err(ConfigError::ValidationError(format!(
                "Listen remote '{}' must be 'host:port'",
                self.remote
            ))),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format: "json" or "text"
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Include target (module path)
    #[serde(default)]
    pub target: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            target: false,
        }
    }
}

impl LogConfig {
    /// Validate logging configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` for unknown levels or formats.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log level: {other}"
                )))
            }
        }
        match self.format.as_str() {
            "json" | "text" => Ok(()),
            other => Err(ConfigError::ValidationError(format!(
                "Invalid log format: {other}"
            ))),
        }
    }
}

// Default value functions

fn default_dns_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 0))
}

const fn default_keepalive_secs() -> u64 {
    3
}

fn default_cluster_suffix() -> String {
    "cluster.local.".into()
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "text".into()
}
