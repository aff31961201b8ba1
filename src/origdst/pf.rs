//! `DIOCNATLOOK` lookup (macOS pf)

use std::net::SocketAddr;

use tokio::net::TcpStream;

use super::OriginalDstResolver;
use crate::error::OrigDstError;
use crate::pf::PfDevice;

/// Resolver for connections redirected by a pf `rdr` rule
#[derive(Debug)]
pub struct PfOrigDst {
    device: PfDevice,
}

impl PfOrigDst {
    /// # Errors
    ///
    /// Returns [`OrigDstError::Pf`] if `/dev/pf` cannot be opened.
    pub fn open() -> Result<Self, OrigDstError> {
        Ok(Self {
            device: PfDevice::open()?,
        })
    }
}

impl OriginalDstResolver for PfOrigDst {
    fn original_dst(&self, conn: &TcpStream) -> Result<SocketAddr, OrigDstError> {
        let peer = conn.peer_addr()?;
        let local = conn.local_addr()?;

        match (peer, local) {
            (SocketAddr::V4(src), SocketAddr::V4(dst)) => {
                let orig = self.device.look_up_nat(src, dst).map_err(|e| {
                    tracing::debug!("natlook for {} -> {} failed: {}", src, dst, e);
                    OrigDstError::NotRedirected { peer }
                })?;
                Ok(SocketAddr::V4(orig))
            }
            _ => Err(OrigDstError::UnsupportedFamily(format!(
                "pf lookup for {peer} -> {local} requires IPv4"
            ))),
        }
    }
}
