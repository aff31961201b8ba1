//! Original destination recovery for redirected connections
//!
//! After a NAT redirect, an accepted socket's local address is the proxy's
//! own. The address the client actually dialed has to be asked from the
//! kernel:
//!
//! - Linux: `getsockopt(SOL_IP, SO_ORIGINAL_DST)` on the accepted socket
//! - macOS: `DIOCNATLOOK` against `/dev/pf` with the observed tuple
//!
//! [`StaticOrigDst`] skips the kernel entirely and always reports one fixed
//! address, for forwarding a single named service.

mod linux;
mod pf;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpStream;

use crate::error::OrigDstError;

pub use linux::{get_original_dst, LinuxOrigDst, SO_ORIGINAL_DST};
pub use pf::PfOrigDst;

/// Recovers the pre-redirect destination of an accepted connection
pub trait OriginalDstResolver: Send + Sync {
    /// # Errors
    ///
    /// Returns [`OrigDstError`] if the kernel has no record of a redirect.
    fn original_dst(&self, conn: &TcpStream) -> Result<SocketAddr, OrigDstError>;
}

/// Always resolves to the same address
#[derive(Debug, Clone, Copy)]
pub struct StaticOrigDst {
    addr: SocketAddr,
}

impl StaticOrigDst {
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }
}

impl OriginalDstResolver for StaticOrigDst {
    fn original_dst(&self, _conn: &TcpStream) -> Result<SocketAddr, OrigDstError> {
        Ok(self.addr)
    }
}

/// Build the resolver for the running OS
///
/// # Errors
///
/// Returns [`OrigDstError`] when the OS is unsupported or `/dev/pf` cannot be
/// opened.
pub fn new_original_dst_resolver() -> Result<Arc<dyn OriginalDstResolver>, OrigDstError> {
    match std::env::consts::OS {
        "linux" => Ok(Arc::new(LinuxOrigDst)),
        "macos" => Ok(Arc::new(PfOrigDst::open()?)),
        other => Err(OrigDstError::UnsupportedFamily(format!(
            "OS '{other}' is not supported for original destination resolution"
        ))),
    }
}
