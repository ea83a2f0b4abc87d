//! Protocol control blocks: the address binding between a channel and its
//! transport state.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::pool::SlotId;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Pcb {
    pub proto: u8,
    pub local: Option<SocketAddr>,
    pub remote: Option<SocketAddr>,
    pub chnl: Option<SlotId>,
    /// TCP only.
    pub tcb: Option<SlotId>,
}

/// The wildcard address of the same family and port.
pub fn wildcard(addr: SocketAddr) -> SocketAddr {
    let ip = match addr.ip() {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };
    SocketAddr::new(ip, addr.port())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_keeps_family_and_port() {
        let v4: SocketAddr = "10.0.0.1:80".parse().unwrap();
        assert_eq!(wildcard(v4), "0.0.0.0:80".parse().unwrap());
        let v6: SocketAddr = "[fe80::1]:443".parse().unwrap();
        assert_eq!(wildcard(v6), "[::]:443".parse().unwrap());
    }
}
