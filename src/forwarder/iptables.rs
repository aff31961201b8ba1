//! Linux redirection driver built on `iptables` NAT chains
//!
//! Two chains are created per session, one hooked into `OUTPUT` (local
//! traffic) and one into `PREROUTING` (forwarded traffic). Each chain
//! redirects the forwarded subnets to the TCP proxy and port 53 of every DNS
//! IP to the DNS server. Packets with TTL 42 are skipped so the proxy's own
//! re-emitted traffic is not caught again. The output chain additionally
//! skips traffic owned by the excluded process group.

use std::net::IpAddr;
use std::sync::Arc;

use ipnet::IpNet;
use tracing::{debug, warn};

use super::cmd::CmdExecutor;
use super::{Forwarder, ForwarderOpts};
use crate::error::ForwarderError;

const IPTABLES: &str = "iptables";

/// Packets carrying this TTL are never redirected
pub const SKIP_TTL: &str = "42";

#[derive(Debug, Clone)]
struct Chain {
    name: String,
    hook: &'static str,
    group_check: Vec<String>,
}

/// iptables-backed [`Forwarder`]
pub struct Iptables {
    opts: ForwarderOpts,
    chains: Vec<Chain>,
    exec: Arc<dyn CmdExecutor>,
}

impl Iptables {
    /// Create a driver whose chains are named after the TCP proxy port
    pub fn new(opts: ForwarderOpts, exec: Arc<dyn CmdExecutor>) -> Self {
        let base = opts.rule_set_name();
        let chains = vec![
            Chain {
                name: format!("{base}-output"),
                hook: "OUTPUT",
                group_check: args(&[
                    "-m",
                    "owner",
                    "!",
                    "--gid-owner",
                    &opts.process_group_id.to_string(),
                ]),
            },
            Chain {
                name: format!("{base}-prerouting"),
                hook: "PREROUTING",
                group_check: Vec::new(),
            },
        ];

        Self { opts, chains, exec }
    }

    fn add_cmds(&self, subnets: &[IpNet], dns_ips: &[IpAddr]) -> Vec<Vec<String>> {
        let tcp_port = self.opts.dst_tcp_port.to_string();
        let dns_tcp_port = self.opts.dst_dns_tcp_port.to_string();
        let dns_udp_port = self.opts.dst_dns_udp_port.to_string();

        let mut cmds = Vec::new();

        for chain in &self.chains {
            cmds.push(args(&["-t", "nat", "-N", &chain.name]));
            cmds.push(args(&["-t", "nat", "-F", &chain.name]));
            cmds.push(args(&["-t", "nat", "-I", chain.hook, "1", "-j", &chain.name]));

            for subnet in subnets {
                let mut cmd = args(&[
                    "-t", "nat", "-A", &chain.name,
                    "-j", "REDIRECT", "--dest", &subnet.to_string(), "-p", "tcp",
                    "--to-ports", &tcp_port,
                    "-m", "ttl", "!", "--ttl", SKIP_TTL,
                ]);
                cmd.extend(chain.group_check.iter().cloned());
                cmds.push(cmd);
            }

            for ip in dns_ips {
                let dest = format!("{ip}/32");
                for (proto, port) in [("tcp", dns_tcp_port.as_str()), ("udp", dns_udp_port.as_str())] {
                    let mut cmd = args(&[
                        "-t", "nat", "-A", &chain.name,
                        "-j", "REDIRECT", "--dest", &dest, "-p", proto,
                        "--dport", "53", "--to-ports", port,
                        "-m", "ttl", "!", "--ttl", SKIP_TTL,
                    ]);
                    cmd.extend(chain.group_check.iter().cloned());
                    cmds.push(cmd);
                }
            }

            cmds.push(args(&[
                "-t", "nat", "-A", &chain.name,
                "-j", "RETURN", "--dest", "127.0.0.0/8", "-p", "tcp",
            ]));
        }

        cmds
    }

    fn reset_cmds(&self) -> Vec<Vec<String>> {
        let mut cmds = Vec::new();
        for chain in &self.chains {
            cmds.push(args(&["-t", "nat", "-D", chain.hook, "-j", &chain.name]));
            cmds.push(args(&["-t", "nat", "-F", &chain.name]));
            cmds.push(args(&["-t", "nat", "-X", &chain.name]));
        }
        cmds
    }

    fn run_cmd(&self, cmd: &[String]) -> Result<String, ForwarderError> {
        let mut full = Vec::with_capacity(cmd.len() + 1);
        full.push("-w".to_string());
        full.extend_from_slice(cmd);
        self.exec.combined_output(IPTABLES, &full, None)
    }
}

impl Forwarder for Iptables {
    fn check_prereqs(&self) -> Result<(), ForwarderError> {
        self.run_cmd(&args(&["-L", "-t", "nat"]))
            .map(|_| ())
            .map_err(|e| {
                ForwarderError::prerequisite(
                    IPTABLES,
                    format!("Checking 'iptables' can run successfully: {e}"),
                )
            })
    }

    fn add(&mut self, subnets: &[IpNet], dns_ips: &[IpAddr]) -> Result<(), ForwarderError> {
        for cmd in self.add_cmds(subnets, dns_ips) {
            self.run_cmd(&cmd)?;
        }
        debug!(chains = self.chains.len(), "Installed iptables chains");
        Ok(())
    }

    fn reset(&mut self) -> Result<(), ForwarderError> {
        let mut errors = Vec::new();
        for cmd in self.reset_cmds() {
            if let Err(e) = self.run_cmd(&cmd) {
                warn!("iptables cleanup step failed: {}", e);
                errors.push(e);
            }
        }
        ForwarderError::from_many(errors)
    }
}

fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| (*s).to_string()).collect()
}
