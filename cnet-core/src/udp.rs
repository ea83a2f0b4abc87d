//! UDP input node and datagram binding.

use std::collections::HashMap;
use std::net::SocketAddr;

use tracing::debug;

use crate::chnl::{Chnl, ChnlError};
use crate::graph::{InputNode, NextNode, NodeOutput, Packet};
use crate::pcb::{wildcard, Pcb};
use crate::pool::SlotId;
use crate::protosw::{CtlReport, IPPROTO_UDP};
use crate::stack::{give_back, Stack};

pub const UDP_HDR_LEN: usize = 8;

/// Per-stack UDP state: bound local address -> PCB.
#[derive(Debug, Default)]
pub struct UdpEntry {
    pub(crate) binds: HashMap<SocketAddr, SlotId>,
}

pub struct UdpInput;

impl InputNode for UdpInput {
    const NAME: &'static str = "udp-input";

    fn process(stack: &mut Stack, pkts: &mut [Packet]) -> NodeOutput {
        let mut out = NodeOutput::with_capacity(pkts.len());
        for pkt in pkts.iter_mut() {
            let next = classify(stack, pkt);
            out.next.push(next);
        }
        out
    }
}

fn classify(stack: &mut Stack, pkt: &mut Packet) -> NextNode {
    if pkt.l4.len() < UDP_HDR_LEN {
        stack.stats().malformed();
        return NextNode::PktDrop;
    }
    let ulen = usize::from(u16::from_be_bytes([pkt.l4[4], pkt.l4[5]]));
    if ulen < UDP_HDR_LEN || ulen > pkt.l4.len() {
        stack.stats().malformed();
        return NextNode::PktDrop;
    }
    // Trailing bytes past the UDP length are link padding.
    pkt.l4.truncate(ulen);
    let dport = u16::from_be_bytes([pkt.l4[2], pkt.l4[3]]);
    let local = SocketAddr::new(pkt.dst, dport);
    let pcb = stack
        .udp
        .binds
        .get(&local)
        .or_else(|| stack.udp.binds.get(&wildcard(local)))
        .copied();
    let Some(pcb) = pcb else {
        return stack.punt_policy().next();
    };
    let chnl = stack.pcb_objs.slot(pcb).and_then(|p| p.chnl);
    let Some(c) = chnl.and_then(|c| stack.chnl_objs.slot_mut(c)) else {
        return NextNode::PktDrop;
    };
    let len = ulen - UDP_HDR_LEN;
    if c.rcv_space() < len {
        // Receive buffer full.
        return NextNode::PktDrop;
    }
    c.rcv_pending += len;
    pkt.meta.chnl = chnl;
    pkt.meta.payload_off = UDP_HDR_LEN as u16;
    NextNode::ChnlRecv
}

/// Allocate a channel and PCB bound to `local`. Returns the channel slot.
pub(crate) fn bind(stack: &mut Stack, local: SocketAddr) -> Result<SlotId, ChnlError> {
    if stack.udp.binds.contains_key(&local) {
        return Err(ChnlError::AddrInUse(local));
    }
    let Some(chnl) = stack.chnl_objs.acquire() else {
        stack.stats().pool_exhausted();
        return Err(ChnlError::NoBufs);
    };
    let Some(pcb) = stack.pcb_objs.acquire() else {
        give_back(&mut stack.chnl_objs, chnl);
        stack.stats().pool_exhausted();
        return Err(ChnlError::NoBufs);
    };
    let (cid, pid) = (chnl.id(), pcb.id());
    if let Some(p) = stack.pcb_objs.get_mut(&pcb) {
        *p = Pcb {
            proto: IPPROTO_UDP,
            local: Some(local),
            chnl: Some(cid),
            ..Pcb::default()
        };
    }
    if let Some(c) = stack.chnl_objs.get_mut(&chnl) {
        *c = Chnl {
            proto: IPPROTO_UDP,
            pcb: Some(pid),
            owned: true,
            ..Chnl::default()
        };
    }
    stack.pcbs.insert(pid, pcb);
    stack.chnls.insert(cid, chnl);
    stack.udp.binds.insert(local, pid);
    debug!(%local, chnl = %cid, "udp bound");
    Ok(cid)
}

/// Remove a binding and release its PCB. The channel is left to its owner.
pub(crate) fn unbind(stack: &mut Stack, pcb: SlotId) -> bool {
    let Some(handle) = stack.pcbs.remove(&pcb) else {
        return false;
    };
    let parts = stack.pcb_objs.get(&handle).map(|p| (p.local, p.chnl));
    if let Some((local, chnl)) = parts {
        if let Some(local) = local {
            if stack.udp.binds.get(&local) == Some(&pcb) {
                stack.udp.binds.remove(&local);
            }
        }
        if let Some(c) = chnl.and_then(|c| stack.chnl_objs.slot_mut(c)) {
            c.pcb = None;
            c.eof = true;
        }
    }
    give_back(&mut stack.pcb_objs, handle);
    true
}

/// Drop every binding.
pub fn drain(stack: &mut Stack) -> CtlReport {
    let pcbs: Vec<SlotId> = stack.udp.binds.values().copied().collect();
    let mut report = CtlReport::default();
    for pcb in pcbs {
        if unbind(stack, pcb) {
            report.reaped += 1;
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CnetConfig, ProtoName};
    use crate::registry::Registry;
    use std::net::{IpAddr, Ipv4Addr};

    fn datagram(dport: u16, payload: &[u8]) -> Packet {
        let mut l4 = Vec::new();
        l4.extend_from_slice(&5353u16.to_be_bytes());
        l4.extend_from_slice(&dport.to_be_bytes());
        l4.extend_from_slice(&((UDP_HDR_LEN + payload.len()) as u16).to_be_bytes());
        l4.extend_from_slice(&[0, 0]);
        l4.extend_from_slice(payload);
        Packet::new(
            IpAddr::V4(Ipv4Addr::new(192, 168, 1, 9)),
            IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1)),
            IPPROTO_UDP,
            l4,
        )
    }

    fn stack_with(reg: &Registry, protocols: Vec<ProtoName>) -> Stack {
        let mut cfg = CnetConfig::with_cores(&[0]);
        cfg.protocols = protocols;
        let mut stk = reg.initialize(&cfg).unwrap().pop().unwrap();
        stk.bind_current_thread().unwrap();
        stk
    }

    #[test]
    fn bound_port_delivers() {
        let reg = Registry::new();
        let mut stk = stack_with(&reg, vec![ProtoName::Udp]);
        let id = stk.chnl_bind_udp("0.0.0.0:5000".parse().unwrap()).unwrap();
        let d = stk
            .input(vec![datagram(5000, b"one"), datagram(5000, b"two")])
            .unwrap();
        assert_eq!(d.delivered, 2);
        assert_eq!(stk.chnl_read(id, 64).unwrap(), b"one".to_vec());
        assert_eq!(stk.chnl_read(id, 2).unwrap(), b"tw".to_vec());
        assert!(stk.chnl_read(id, 64).unwrap().is_empty());
    }

    #[test]
    fn short_or_lying_header_is_malformed() {
        let reg = Registry::new();
        let mut stk = stack_with(&reg, vec![ProtoName::Udp, ProtoName::Raw]);
        let mut lying = datagram(5000, b"abc");
        lying.l4[5] = 200;
        let mut short = datagram(5000, b"");
        short.l4.truncate(6);
        let d = stk.input(vec![lying, short]).unwrap();
        assert_eq!(d.dropped, 2);
        assert!(d.punted.is_empty());
        assert_eq!(stk.handle().stats().malformed, 2);
    }

    #[test]
    fn unbound_port_follows_punt_policy() {
        let reg = Registry::new();
        let mut stk = stack_with(&reg, vec![ProtoName::Udp]);
        assert_eq!(stk.input(vec![datagram(9, b"x")]).unwrap().dropped, 1);

        let reg = Registry::new();
        let mut cfg = CnetConfig::with_cores(&[1]);
        cfg.protocols = vec![ProtoName::Udp, ProtoName::Raw];
        let mut stk = reg.initialize(&cfg).unwrap().pop().unwrap();
        std::thread::scope(|s| {
            s.spawn(|| {
                stk.bind_current_thread().unwrap();
                assert_eq!(stk.input(vec![datagram(9, b"x")]).unwrap().punted.len(), 1);
            });
        });
    }

    #[test]
    fn full_channel_drops() {
        let reg = Registry::new();
        let mut stk = stack_with(&reg, vec![ProtoName::Udp]);
        let id = stk.chnl_bind_udp("192.168.1.1:7".parse().unwrap()).unwrap();
        stk.chnl_set_opt(id, crate::chnl::ChnlOpt::RcvBuf(4)).unwrap();
        let d = stk
            .input(vec![datagram(7, b"abc"), datagram(7, b"de")])
            .unwrap();
        assert_eq!((d.delivered, d.dropped), (1, 1));
    }

    #[test]
    fn drain_releases_bindings() {
        let reg = Registry::new();
        let mut stk = stack_with(&reg, vec![ProtoName::Udp]);
        stk.chnl_bind_udp("0.0.0.0:1".parse().unwrap()).unwrap();
        stk.chnl_bind_udp("0.0.0.0:2".parse().unwrap()).unwrap();
        assert_eq!(stk.pools_in_use().pcbs, 2);
        let report = stk.stop().unwrap();
        assert_eq!(report.drained.reaped, 2);
        assert_eq!(report.chnls_released, 2);
        assert_eq!(report.leaked.total(), 0);
    }
}
