//! Protocol switch table: IP protocol number -> protocol handler.
//!
//! Built once per instance from the configuration and read-only afterwards.
//! Lookup is a direct index into a 256-entry vector; unbound numbers hold
//! [`PROTOSW_FREE_SLOT`].

use crate::config::ProtoName;
use crate::graph::{InputNode, NodeOutput, Packet};
use crate::raw::{IcmpInput, RawInput};
use crate::stack::Stack;
use crate::tcp::{self, TcpInput, TcpSegment};
use crate::udp::{self, UdpInput};

/// Marks a protocol number with no bound handler.
pub const PROTOSW_FREE_SLOT: u16 = 0xFFFF;

pub const IPPROTO_ICMP: u8 = 1;
pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;
pub const IPPROTO_ICMPV6: u8 = 58;
pub const IPPROTO_RAW: u8 = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Domain {
    Inet,
    Inet6,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockType {
    Stream,
    Dgram,
    Raw,
}

/// Closed set of protocol handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
    Icmp6,
    Raw,
}

/// Control requests delivered to every bound protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtoCtl {
    /// Periodic sweep: expire idle connections, fire retransmissions.
    SlowTimeout,
    /// Release every protocol-owned object; used by stop.
    Drain,
}

/// What a control request did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CtlReport {
    /// Connections removed because they closed or were drained.
    pub reaped: usize,
    /// Connections removed for inactivity or retransmission exhaustion.
    pub expired: usize,
    /// Connections that had segments scheduled for retransmission.
    pub retransmitted: usize,
}

impl CtlReport {
    pub fn merge(&mut self, other: CtlReport) {
        self.reaped += other.reaped;
        self.expired += other.expired;
        self.retransmitted += other.retransmitted;
    }
}

impl Protocol {
    pub fn number(self) -> u8 {
        match self {
            Protocol::Tcp => IPPROTO_TCP,
            Protocol::Udp => IPPROTO_UDP,
            Protocol::Icmp => IPPROTO_ICMP,
            Protocol::Icmp6 => IPPROTO_ICMPV6,
            Protocol::Raw => IPPROTO_RAW,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Icmp => "icmp",
            Protocol::Icmp6 => "icmp6",
            Protocol::Raw => "raw",
        }
    }

    fn domain(self) -> Domain {
        match self {
            Protocol::Icmp6 => Domain::Inet6,
            _ => Domain::Inet,
        }
    }

    fn sock_type(self) -> SockType {
        match self {
            Protocol::Tcp => SockType::Stream,
            Protocol::Udp => SockType::Dgram,
            Protocol::Icmp | Protocol::Icmp6 | Protocol::Raw => SockType::Raw,
        }
    }

    /// Run the protocol's input node over one batch.
    pub fn handle_input(self, stack: &mut Stack, pkts: &mut [Packet]) -> NodeOutput {
        match self {
            Protocol::Tcp => TcpInput::process(stack, pkts),
            Protocol::Udp => UdpInput::process(stack, pkts),
            Protocol::Icmp | Protocol::Icmp6 => IcmpInput::process(stack, pkts),
            Protocol::Raw => RawInput::process(stack, pkts),
        }
    }

    /// Run the protocol's output routine. Only TCP queues segments.
    pub fn handle_output(self, stack: &mut Stack) -> Vec<TcpSegment> {
        match self {
            Protocol::Tcp => tcp::tcp_output(stack),
            Protocol::Udp | Protocol::Icmp | Protocol::Icmp6 | Protocol::Raw => Vec::new(),
        }
    }

    pub fn handle_control(self, stack: &mut Stack, ctl: ProtoCtl) -> CtlReport {
        match (self, ctl) {
            (Protocol::Tcp, ProtoCtl::SlowTimeout) => tcp::slow_timeout(stack),
            (Protocol::Tcp, ProtoCtl::Drain) => tcp::drain(stack),
            (Protocol::Udp, ProtoCtl::Drain) => udp::drain(stack),
            (Protocol::Udp, ProtoCtl::SlowTimeout)
            | (Protocol::Icmp | Protocol::Icmp6 | Protocol::Raw, _) => CtlReport::default(),
        }
    }
}

impl From<ProtoName> for Protocol {
    fn from(name: ProtoName) -> Self {
        match name {
            ProtoName::Tcp => Protocol::Tcp,
            ProtoName::Udp => Protocol::Udp,
            ProtoName::Icmp => Protocol::Icmp,
            ProtoName::Icmp6 => Protocol::Icmp6,
            ProtoName::Raw => Protocol::Raw,
        }
    }
}

/// One bound protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtoSwEntry {
    pub name: &'static str,
    pub domain: Domain,
    pub sock_type: SockType,
    pub proto: u8,
    pub handler: Protocol,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtoSwError {
    #[error("protocol {0} bound twice")]
    Duplicate(&'static str),
}

#[derive(Debug, Clone)]
pub struct ProtoSwTable {
    entries: Vec<ProtoSwEntry>,
    index: Vec<u16>,
}

impl ProtoSwTable {
    pub fn new(protocols: &[ProtoName]) -> Result<Self, ProtoSwError> {
        let mut table = Self {
            entries: Vec::with_capacity(protocols.len()),
            index: vec![PROTOSW_FREE_SLOT; 256],
        };
        for &name in protocols {
            let p = Protocol::from(name);
            let n = p.number() as usize;
            if table.index[n] != PROTOSW_FREE_SLOT {
                return Err(ProtoSwError::Duplicate(p.name()));
            }
            table.index[n] = table.entries.len() as u16;
            table.entries.push(ProtoSwEntry {
                name: p.name(),
                domain: p.domain(),
                sock_type: p.sock_type(),
                proto: p.number(),
                handler: p,
            });
        }
        Ok(table)
    }

    /// Raw slot value for a protocol number: an entry index or
    /// [`PROTOSW_FREE_SLOT`].
    pub fn slot(&self, proto: u8) -> u16 {
        self.index[proto as usize]
    }

    pub fn lookup(&self, proto: u8) -> Option<&ProtoSwEntry> {
        match self.slot(proto) {
            PROTOSW_FREE_SLOT => None,
            i => self.entries.get(i as usize),
        }
    }

    pub fn contains(&self, p: Protocol) -> bool {
        self.lookup(p.number()).is_some()
    }

    pub fn entries(&self) -> &[ProtoSwEntry] {
        &self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unbound_numbers_read_free_slot() {
        let table = ProtoSwTable::new(&[ProtoName::Tcp, ProtoName::Udp]).unwrap();
        assert_eq!(table.slot(IPPROTO_TCP), 0);
        assert_eq!(table.slot(IPPROTO_UDP), 1);
        assert_eq!(table.slot(IPPROTO_ICMP), PROTOSW_FREE_SLOT);
        assert!(table.lookup(IPPROTO_RAW).is_none());
        let free = (0..=255u8)
            .filter(|&p| table.slot(p) == PROTOSW_FREE_SLOT)
            .count();
        assert_eq!(free, 254);
    }

    #[test]
    fn lookup_returns_bound_handler() {
        let table = ProtoSwTable::new(&[ProtoName::Icmp6, ProtoName::Raw]).unwrap();
        let e = table.lookup(IPPROTO_ICMPV6).unwrap();
        assert_eq!(e.handler, Protocol::Icmp6);
        assert_eq!(e.domain, Domain::Inet6);
        assert_eq!(e.sock_type, SockType::Raw);
        assert!(table.contains(Protocol::Raw));
        assert!(!table.contains(Protocol::Tcp));
    }

    #[test]
    fn duplicate_protocol_rejected() {
        assert_eq!(
            ProtoSwTable::new(&[ProtoName::Tcp, ProtoName::Tcp]).unwrap_err(),
            ProtoSwError::Duplicate("tcp")
        );
    }
}
