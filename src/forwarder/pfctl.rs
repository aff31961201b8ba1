//! macOS redirection driver built on `pfctl` anchors
//!
//! Rules live in a dedicated anchor named after the TCP proxy port. The main
//! ruleset must reference that anchor twice (once as `rdr-anchor`, once as
//! `anchor`); pfctl cannot add such references without replacing the whole
//! main ruleset, so they are added through `/dev/pf` directly.

use std::net::IpAddr;
use std::sync::Arc;

use ipnet::IpNet;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, warn};

use super::cmd::CmdExecutor;
use super::{Forwarder, ForwarderOpts};
use crate::error::ForwarderError;
use crate::pf::{AnchorControl, RuleAction};

const PFCTL: &str = "pfctl";

// Piece of example output: 'Token : 13073750315387878699'
static ENABLE_TOKEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Token : (.+)").expect("token pattern is a valid regex"));

const ANCHOR_ACTIONS: [RuleAction; 2] = [RuleAction::Rdr, RuleAction::Pass];

/// pfctl-backed [`Forwarder`]
pub struct Pfctl {
    name: String,
    opts: ForwarderOpts,
    enable_token: Option<String>,
    exec: Arc<dyn CmdExecutor>,
    anchors: Arc<dyn AnchorControl>,
}

impl Pfctl {
    /// Create a driver whose anchor is named after the TCP proxy port
    pub fn new(
        opts: ForwarderOpts,
        exec: Arc<dyn CmdExecutor>,
        anchors: Arc<dyn AnchorControl>,
    ) -> Self {
        Self {
            name: opts.rule_set_name(),
            opts,
            enable_token: None,
            exec,
            anchors,
        }
    }

    /// Token returned by `pfctl -E`, if pf was enabled by us
    #[must_use]
    pub fn enable_token(&self) -> Option<&str> {
        self.enable_token.as_deref()
    }

    fn run(&self, args: &[&str], stdin: Option<&str>) -> Result<String, ForwarderError> {
        let args: Vec<String> = args.iter().map(|s| (*s).to_string()).collect();
        self.exec.combined_output(PFCTL, &args, stdin)
    }

    fn add_anchor_if_not_exists(&self) -> Result<(), ForwarderError> {
        let output = self.run(&["-s", "all"], None)?;

        for action in ANCHOR_ACTIONS {
            let keyword = action.anchor_keyword();
            // Leading newline avoids matching a longer anchor name
            if !output.contains(&format!("\n{} \"{}\"", keyword, self.name)) {
                self.anchors
                    .add_anchor_if_not_exist(&self.name, action)
                    .map_err(|e| ForwarderError::command(format!("adding {keyword}"), e.to_string()))?;
            }
        }
        Ok(())
    }

    /// Rules loaded into the anchor
    #[must_use]
    pub fn rules(&self, subnets: &[IpNet], dns_ips: &[IpAddr]) -> String {
        let mut subnet_strs = vec!["!127.0.0.1/32".to_string()];
        subnet_strs.extend(subnets.iter().map(ToString::to_string));

        let dns_strs: Vec<String> = dns_ips.iter().map(ToString::to_string).collect();
        let exclude_group = format!("group {{!={}}}", self.opts.process_group_id);

        format!(
            "
table <forward_subnets> {{{subnets}}}
table <dns_servers> {{{dns}}}
rdr pass on lo0 inet proto tcp to <forward_subnets> -> 127.0.0.1 port {tcp}
rdr pass on lo0 inet proto udp to <dns_servers> port 53 -> 127.0.0.1 port {dns_udp}
pass out route-to lo0 inet proto tcp to <forward_subnets> keep state {group}
pass out route-to lo0 inet proto udp to <dns_servers> port 53 keep state {group}
",
            subnets = subnet_strs.join(","),
            dns = dns_strs.join(","),
            tcp = self.opts.dst_tcp_port,
            dns_udp = self.opts.dst_dns_udp_port,
            group = exclude_group,
        )
    }
}

impl Forwarder for Pfctl {
    fn check_prereqs(&self) -> Result<(), ForwarderError> {
        self.run(&["-s", "info"], None).map(|_| ()).map_err(|e| {
            ForwarderError::prerequisite(PFCTL, format!("Checking 'pfctl' can run successfully: {e}"))
        })
    }

    fn add(&mut self, subnets: &[IpNet], dns_ips: &[IpAddr]) -> Result<(), ForwarderError> {
        self.add_anchor_if_not_exists()?;

        let rules = self.rules(subnets, dns_ips);
        debug!("Will run pfctl with following rules: {}", rules);
        self.run(&["-a", &self.name, "-f", "-"], Some(rules.as_str()))?;

        let output = self.run(&["-E"], None)?;
        if let Some(caps) = ENABLE_TOKEN_RE.captures(&output) {
            self.enable_token = caps.get(1).map(|m| m.as_str().trim().to_string());
        }

        Ok(())
    }

    fn reset(&mut self) -> Result<(), ForwarderError> {
        let mut errors = Vec::new();

        if let Err(e) = self.run(&["-a", &self.name, "-F", "all"], None) {
            warn!("pfctl flush failed: {}", e);
            errors.push(e);
        }

        if let Err(e) = self.anchors.delete_anchor_if_exists(&self.name, &ANCHOR_ACTIONS) {
            warn!("pf anchor removal failed: {}", e);
            errors.push(e.into());
        }

        if let Some(token) = self.enable_token.clone() {
            match self.run(&["-X", &token], None) {
                Ok(_) => self.enable_token = None,
                Err(e) => {
                    warn!("pfctl release failed: {}", e);
                    errors.push(e);
                }
            }
        }

        ForwarderError::from_many(errors)
    }
}
