//! `struct pfioc_natlook`

use std::net::{Ipv4Addr, SocketAddrV4};

use super::PF_OUT;

/// Size of `struct pfioc_natlook` on Darwin
pub const PFIOC_NATLOOK_SIZE: usize = 84;

/// NAT state lookup request
///
/// Addresses and ports are stored in network byte order. Only the first
/// element of each address/port array is used for IPv4.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct PfiocNatlook {
    pub saddr: [u32; 4],
    pub daddr: [u32; 4],
    pub rsaddr: [u32; 4],
    pub rdaddr: [u32; 4],
    pub sxport: [u16; 2],
    pub dxport: [u16; 2],
    pub rsxport: [u16; 2],
    pub rdxport: [u16; 2],
    pub af: u8,
    pub proto: u8,
    pub proto_variant: u8,
    pub direction: u8,
}

impl PfiocNatlook {
    /// Build an outbound TCP lookup for the observed tuple
    #[must_use]
    pub fn for_tcp_out(src: SocketAddrV4, dst: SocketAddrV4) -> Self {
        let mut natlook = Self::default();
        natlook.saddr[0] = u32::from(*src.ip()).to_be();
        natlook.sxport[0] = src.port().to_be();
        natlook.daddr[0] = u32::from(*dst.ip()).to_be();
        natlook.dxport[0] = dst.port().to_be();
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        {
            natlook.af = libc::AF_INET as u8;
            natlook.proto = libc::IPPROTO_TCP as u8;
        }
        natlook.direction = PF_OUT;
        natlook
    }

    /// Destination before redirection, as filled in by the kernel
    #[must_use]
    pub fn redirected_dst(&self) -> SocketAddrV4 {
        SocketAddrV4::new(
            Ipv4Addr::from(u32::from_be(self.rdaddr[0])),
            u16::from_be(self.rdxport[0]),
        )
    }
}
