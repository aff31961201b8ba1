//! Local interface addresses via `getifaddrs(3)`

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Every address assigned to a local interface, loopback included
///
/// # Errors
///
/// Returns the OS error if `getifaddrs` fails.
pub fn interface_addrs() -> io::Result<Vec<IpAddr>> {
    let mut head: *mut libc::ifaddrs = std::ptr::null_mut();

    // SAFETY: getifaddrs initializes `head` on success; it is released below
    if unsafe { libc::getifaddrs(&raw mut head) } != 0 {
        return Err(io::Error::last_os_error());
    }

    let mut addrs = Vec::new();
    let mut cursor = head;
    while !cursor.is_null() {
        // SAFETY: `cursor` walks the list returned by getifaddrs
        let entry = unsafe { &*cursor };
        if let Some(ip) = unsafe { sockaddr_ip(entry.ifa_addr) } {
            if !addrs.contains(&ip) {
                addrs.push(ip);
            }
        }
        cursor = entry.ifa_next;
    }

    // SAFETY: `head` came from a successful getifaddrs
    unsafe { libc::freeifaddrs(head) };

    Ok(addrs)
}

/// Non-loopback IPv4 interface addresses
///
/// # Errors
///
/// Returns the OS error if `getifaddrs` fails.
pub fn local_ipv4s() -> io::Result<Vec<Ipv4Addr>> {
    Ok(interface_addrs()?
        .into_iter()
        .filter_map(|ip| match ip {
            IpAddr::V4(v4) if !v4.is_loopback() => Some(v4),
            _ => None,
        })
        .collect())
}

/// # Safety
///
/// `addr` must be null or point to a valid socket address.
unsafe fn sockaddr_ip(addr: *const libc::sockaddr) -> Option<IpAddr> {
    if addr.is_null() {
        return None;
    }

    match i32::from((*addr).sa_family) {
        libc::AF_INET => {
            let sin = &*addr.cast::<libc::sockaddr_in>();
            Some(IpAddr::V4(Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr))))
        }
        libc::AF_INET6 => {
            let sin6 = &*addr.cast::<libc::sockaddr_in6>();
            Some(IpAddr::V6(Ipv6Addr::from(sin6.sin6_addr.s6_addr)))
        }
        _ => None,
    }
}
