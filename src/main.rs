//! kwt-net: forward subnets and cluster DNS through an SSH tunnel
//!
//! # Usage
//!
//! ```bash
//! # Forward guessed subnets using a config file
//! sudo ./kwt-net -c /etc/kwt-net/config.json
//!
//! # Forward an explicit subnet over a given SSH endpoint
//! sudo ./kwt-net --subnet 10.0.0.0/16 --ssh-user tunnel \
//!     --ssh-host 203.0.113.10:22 --ssh-private-key ~/.ssh/id_ed25519
//!
//! # Only intercept DNS
//! sudo ./kwt-net --dns-only --dns-map app.test=127.0.0.1
//! ```

use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{error, info, Level};
use tracing_subscriber::EnvFilter;

use kwt_net::config::{apply_env_overrides, load_config_with_env, Config, ListenForwardConfig, SshConfig};
use kwt_net::dns::DnsEngine;
use kwt_net::forwarder::{Factory, OsCmdExecutor};
use kwt_net::origdst::new_original_dst_resolver;
use kwt_net::session::{DnsOnlyProxy, ForwardingProxy, ListenProxy, RemotingProxy};
use kwt_net::subnets::{ConfiguredSubnets, GuessedSubnets, KubeSubnets, ResolvConfDnsIps, Subnets};
use kwt_net::tunnel::{
    Dialer, EntryPoint, ReconnListener, ReconnectingTunnel, SshSessionFactory, StaticSshEntryPoint,
};

/// Command-line arguments
#[derive(Default)]
struct Args {
    /// Configuration file path
    config_path: Option<PathBuf>,
    subnets: Vec<String>,
    remote_ips: Vec<String>,
    dns_recursors: Vec<String>,
    /// `domain=ip` pairs
    dns_map: Vec<String>,
    dns_map_exec: Vec<String>,
    dns_mdns: bool,
    ssh_user: Option<String>,
    ssh_host: Option<String>,
    ssh_private_key: Option<String>,
    /// `remote=local` pairs
    listen: Vec<String>,
    debug: bool,
    dns_only: bool,
}

impl Args {
    fn parse() -> Self {
        let mut args = std::env::args().skip(1);
        let mut parsed = Self::default();

        while let Some(arg) = args.next() {
            let mut value = |name: &str| match args.next() {
                Some(v) => v,
                None => {
                    eprintln!("Missing value for {name}");
                    print_help();
                    std::process::exit(1);
                }
            };

            match arg.as_str() {
                "-c" | "--config" => parsed.config_path = Some(PathBuf::from(value(&arg))),
                "--subnet" => parsed.subnets.push(value(&arg)),
                "--remote-ip" => parsed.remote_ips.push(value(&arg)),
                "--dns-recursor" => parsed.dns_recursors.push(value(&arg)),
                "--dns-map" => parsed.dns_map.push(value(&arg)),
                "--dns-map-exec" => parsed.dns_map_exec.push(value(&arg)),
                "--dns-mdns" => parsed.dns_mdns = true,
                "--ssh-user" => parsed.ssh_user = Some(value(&arg)),
                "--ssh-host" => parsed.ssh_host = Some(value(&arg)),
                "--ssh-private-key" => parsed.ssh_private_key = Some(value(&arg)),
                "--listen" => parsed.listen.push(value(&arg)),
                "--debug" => parsed.debug = true,
                "--dns-only" => parsed.dns_only = true,
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "-v" | "--version" => {
                    println!("kwt-net v{}", kwt_net::VERSION);
                    std::process::exit(0);
                }
                _ => {
                    eprintln!("Unknown argument: {arg}");
                    print_help();
                    std::process::exit(1);
                }
            }
        }

        parsed
    }

    /// Layer flags over the loaded configuration
    fn apply(self, config: &mut Config) -> Result<()> {
        config.subnets.extend(self.subnets);
        config.remote_ips.extend(self.remote_ips);
        config.dns.recursors.extend(self.dns_recursors);
        config.dns.map_exec.extend(self.dns_map_exec);
        config.dns.mdns |= self.dns_mdns;

        for pair in &self.dns_map {
            let (domain, ip) = pair
                .split_once('=')
                .with_context(|| format!("Expected --dns-map '{pair}' to be 'domain=ip'"))?;
            let ip: IpAddr = ip
                .parse()
                .with_context(|| format!("Parsing --dns-map IP '{ip}'"))?;
            config.dns.map.entry(domain.to_string()).or_default().push(ip);
        }

        for pair in &self.listen {
            let (remote, local) = pair
                .split_once('=')
                .with_context(|| format!("Expected --listen '{pair}' to be 'remote=local'"))?;
            let local: SocketAddr = local
                .parse()
                .with_context(|| format!("Parsing --listen local address '{local}'"))?;
            config.listen.push(ListenForwardConfig {
                remote: remote.to_string(),
                local,
            });
        }

        if self.ssh_user.is_some() || self.ssh_host.is_some() || self.ssh_private_key.is_some() {
            let mut ssh = config.ssh.take().unwrap_or_else(|| SshConfig {
                user: String::new(),
                host: String::new(),
                private_key: String::new(),
                host_public_key: None,
                keepalive_secs: 3,
            });
            if let Some(user) = self.ssh_user {
                ssh.user = user;
            }
            if let Some(host) = self.ssh_host {
                ssh.host = host;
            }
            if let Some(key) = self.ssh_private_key {
                ssh.private_key = key;
            }
            config.ssh = Some(ssh);
        }

        if self.debug {
            config.log.level = "debug".into();
        }

        config.validate()?;
        Ok(())
    }
}

fn print_help() {
    println!(
        r#"kwt-net v{}

Transparently forward subnets and cluster DNS through an SSH tunnel.

USAGE:
    kwt-net [OPTIONS]

OPTIONS:
    -c, --config <PATH>           Configuration file path
    --subnet <CIDR>               Subnet to forward (repeatable)
    --remote-ip <IP>              Remote IP used to guess subnets (repeatable)
    --dns-recursor <IP[:PORT]>    Upstream DNS recursor (repeatable)
    --dns-map <DOMAIN=IP>         Static DNS mapping (repeatable)
    --dns-map-exec <CMD>          Command printing {{domain: [ips]}} JSON (repeatable)
    --dns-mdns                    Answer .local names over multicast DNS
    --ssh-user <USER>             SSH user
    --ssh-host <HOST:PORT>        SSH server
    --ssh-private-key <PEM|PATH>  SSH private key
    --listen <REMOTE=LOCAL>       Relay a remote listener to a local address (repeatable)
    --dns-only                    Only start the DNS server and intercept DNS
    --debug                       Debug logging
    -h, --help                    Print help information
    -v, --version                 Print version information

ENVIRONMENT:
    KWT_NET_LOG_LEVEL             Override log level
    KWT_NET_SSH_HOST              Override SSH host
    KWT_NET_DNS_RECURSORS         Override DNS recursors (comma separated)
    KWT_NET_PROCESS_GROUP_ID      Override the excluded process group id

REQUIREMENTS:
    - root, to install redirection rules and bind DNS
    - iptables (Linux) or pfctl (macOS)
"#,
        kwt_net::VERSION
    );
}

/// Initialize logging
fn init_logging(config: &Config) {
    let level = match config.log.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["russh=warn", "hickory_proto=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.log.target);

    if config.log.format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    match path {
        Some(path) => load_config_with_env(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display())),
        None => {
            let mut config = Config::default_config();
            apply_env_overrides(&mut config)?;
            Ok(config)
        }
    }
}

/// Group whose traffic is never redirected
fn process_group_id(config: &Config) -> u32 {
    // SAFETY: getegid has no preconditions and cannot fail
    config
        .process_group_id
        .unwrap_or_else(|| unsafe { libc::getegid() })
}

fn subnets_provider(config: &Config) -> Result<Arc<dyn Subnets>> {
    if !config.subnets.is_empty() {
        return Ok(Arc::new(ConfiguredSubnets::new(config.subnets.clone())));
    }

    let remote_ips = config.parsed_remote_ips()?;
    if config.cluster.use_kubectl {
        Ok(Arc::new(KubeSubnets::new(Arc::new(OsCmdExecutor), remote_ips)))
    } else {
        Ok(Arc::new(GuessedSubnets::new(remote_ips)))
    }
}

/// Run `serving` until it ends or a shutdown signal arrives, then let it
/// finish tearing down
async fn run_until_signal<F>(serving: F, shutdown: impl FnOnce()) -> kwt_net::error::Result<()>
where
    F: Future<Output = kwt_net::error::Result<()>>,
{
    tokio::pin!(serving);

    tokio::select! {
        result = &mut serving => return result,
        _ = signal::ctrl_c() => info!("Received SIGINT, shutting down"),
        _ = wait_for_sigterm() => info!("Received SIGTERM, shutting down"),
    }

    shutdown();
    serving.await
}

async fn start_listeners(
    forwards: &[ListenForwardConfig],
    entry_point: Arc<dyn EntryPoint>,
) -> Result<(Vec<Arc<ListenProxy>>, Vec<JoinHandle<()>>)> {
    if forwards.is_empty() {
        return Ok((Vec::new(), Vec::new()));
    }

    let tunnel: Arc<dyn Dialer> = Arc::new(ReconnectingTunnel::new(Arc::new(
        SshSessionFactory::new(entry_point),
    )));

    let mut proxies = Vec::new();
    let mut handles = Vec::new();
    for forward in forwards {
        let listener = ReconnListener::bind(forward.remote.clone(), Arc::clone(&tunnel))
            .await
            .with_context(|| format!("Listening remotely on {}", forward.remote))?;
        let proxy = Arc::new(ListenProxy::new(
            Arc::new(listener),
            forward.remote.clone(),
            forward.local,
        ));

        let serving = Arc::clone(&proxy);
        handles.push(tokio::spawn(async move {
            let (started_tx, _started_rx) = tokio::sync::oneshot::channel();
            if let Err(e) = serving.serve(started_tx).await {
                error!(error = %e, "Reverse forward failed");
            }
        }));
        proxies.push(proxy);
    }

    Ok((proxies, handles))
}

/// Main application entry point
#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config_path = args.config_path.clone();
    let dns_only = args.dns_only;

    let mut config = load_config(config_path.as_ref())?;
    args.apply(&mut config)?;

    init_logging(&config);
    info!("kwt-net v{}", kwt_net::VERSION);

    if !kwt_net::is_root() {
        bail!("Command must run under sudo to install redirection rules and bind DNS");
    }
    if cfg!(target_os = "macos") {
        kwt_net::pf::verify_layouts().context("Checking packet filter struct layouts")?;
    }

    let exec = Arc::new(OsCmdExecutor);
    let factory = Arc::new(Factory::new(process_group_id(&config)));
    let dns = Arc::new(DnsEngine::from_config(&config, exec)?);

    if dns_only {
        let proxy = DnsOnlyProxy::new(factory, dns, Arc::new(ResolvConfDnsIps::default()));
        run_until_signal(proxy.serve(), || proxy.shutdown()).await?;
        info!("Shutdown complete");
        return Ok(());
    }

    let ssh = config
        .ssh
        .as_ref()
        .context("Expected SSH credentials (ssh config section or --ssh-* flags)")?;
    let entry_point: Arc<dyn EntryPoint> = Arc::new(StaticSshEntryPoint::from_config(ssh)?);

    let (listeners, listener_tasks) = start_listeners(&config.listen, Arc::clone(&entry_point)).await?;

    let forwarding = ForwardingProxy::new(factory, new_original_dst_resolver()?, dns);
    let proxy = RemotingProxy::new(
        entry_point,
        subnets_provider(&config)?,
        Arc::new(ResolvConfDnsIps::default()),
        forwarding,
    );

    let result = run_until_signal(proxy.serve(), || proxy.shutdown()).await;

    for listener in &listeners {
        listener.shutdown().await;
    }
    for task in listener_tasks {
        let _ = task.await;
    }

    info!("Shutdown complete");
    result.map_err(Into::into)
}

/// Wait for SIGTERM signal
#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            error!(error = %e, "Failed to register SIGTERM handler");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    std::future::pending::<()>().await
}
