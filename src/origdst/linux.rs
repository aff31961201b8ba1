//! `SO_ORIGINAL_DST` lookup (Linux netfilter)

use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};

use tokio::net::TcpStream;

use super::OriginalDstResolver;
use crate::error::OrigDstError;

/// Linux kernel constant: `SO_ORIGINAL_DST` (`SOL_IP` level)
pub const SO_ORIGINAL_DST: libc::c_int = 80;

/// Resolver for connections redirected by iptables `REDIRECT`
#[derive(Debug, Default, Clone, Copy)]
pub struct LinuxOrigDst;

impl OriginalDstResolver for LinuxOrigDst {
    fn original_dst(&self, conn: &TcpStream) -> Result<SocketAddr, OrigDstError> {
        get_original_dst(conn.as_raw_fd())
    }
}

/// Get the pre-NAT IPv4 destination of a redirected TCP connection
///
/// # Errors
///
/// Returns `OrigDstError::SocketOption` if:
/// - The connection was not redirected (ENOPROTOOPT / ENOENT)
/// - getsockopt fails for any other reason
#[cfg(target_os = "linux")]
pub fn get_original_dst(fd: RawFd) -> Result<SocketAddr, OrigDstError> {
    use std::io;
    use std::mem;
    use std::net::{Ipv4Addr, SocketAddrV4};

    // SAFETY: sockaddr_in is plain old data
    let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
    #[allow(clippy::cast_possible_truncation)]
    let mut len: libc::socklen_t = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;

    // SAFETY: addr and len outlive the call and len holds addr's size
    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_IP,
            SO_ORIGINAL_DST,
            std::ptr::addr_of_mut!(addr).cast::<libc::c_void>(),
            &raw mut len,
        )
    };

    if ret != 0 {
        let err = io::Error::last_os_error();
        if matches!(err.raw_os_error(), Some(libc::ENOPROTOOPT | libc::ENOENT)) {
            return Err(OrigDstError::socket_option(
                "SO_ORIGINAL_DST",
                "not available - connection was not redirected?",
            ));
        }
        return Err(OrigDstError::socket_option("SO_ORIGINAL_DST", err.to_string()));
    }

    if i32::from(addr.sin_family) != libc::AF_INET {
        return Err(OrigDstError::UnsupportedFamily(format!(
            "address family {}",
            addr.sin_family
        )));
    }

    let port = u16::from_be(addr.sin_port);
    let ip = Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));

    Ok(SocketAddr::V4(SocketAddrV4::new(ip, port)))
}

/// `SO_ORIGINAL_DST` only exists on Linux
///
/// # Errors
///
/// Always returns `OrigDstError::SocketOption`.
#[cfg(not(target_os = "linux"))]
pub fn get_original_dst(_fd: RawFd) -> Result<SocketAddr, OrigDstError> {
    Err(OrigDstError::socket_option(
        "SO_ORIGINAL_DST",
        "only supported on Linux",
    ))
}
