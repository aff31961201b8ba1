//! Session orchestration
//!
//! - [`RemotingProxy`]: resolves subnets and DNS IPs, connects the tunnel and
//!   runs a [`ForwardingProxy`] over it
//! - [`ForwardingProxy`]: starts the proxies and the DNS engine, installs the
//!   redirection rules once their ports are known, tears everything down in
//!   a fixed order
//! - [`DnsOnlyProxy`]: the DNS engine plus port 53 interception only
//! - [`ListenProxy`]: relays connections accepted by a remote listener to a
//!   local address

mod dns_only;
mod forwarding;
mod listen;
mod remoting;

pub use dns_only::{DnsOnlyProxy, DNS_ONLY_TCP_PORT};
pub use forwarding::{ForwardingProxy, SHUTDOWN_GRACE};
pub use listen::ListenProxy;
pub use remoting::RemotingProxy;
