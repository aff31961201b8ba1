//! Data plane for intercepted traffic
//!
//! - [`TcpProxy`]: accepts redirected connections, recovers their original
//!   destination and relays them through the tunnel
//! - [`UdpProxy`]: receives redirected datagrams (not relayed)
//! - [`relay`]: bidirectional copy with half-close, shared with the reverse
//!   listener

mod copy;
mod tcp;
mod udp;

pub use copy::{relay, relay_with_buffer, CopyResult, DEFAULT_BUFFER_SIZE};
pub use tcp::TcpProxy;
pub use udp::UdpProxy;
