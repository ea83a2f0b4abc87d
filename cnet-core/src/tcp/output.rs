use std::net::SocketAddr;

use crate::graph::Packet;
use crate::protosw::IPPROTO_TCP;
use crate::stack::Stack;

use super::{TcpFlags, TcpHeader, TcpState, TCP_HDR_LEN};

/// A segment handed to the I/O framework for transmission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpSegment {
    pub local: SocketAddr,
    pub remote: SocketAddr,
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub window: u16,
    pub payload: Vec<u8>,
}

impl TcpSegment {
    /// Encode as the packet the peer will receive.
    pub fn to_packet(&self) -> Packet {
        let mut l4 = Vec::with_capacity(TCP_HDR_LEN + self.payload.len());
        TcpHeader {
            src_port: self.local.port(),
            dst_port: self.remote.port(),
            seq: self.seq,
            ack: self.ack,
            hdr_len: TCP_HDR_LEN,
            flags: self.flags,
            window: self.window,
        }
        .write(&mut l4);
        l4.extend_from_slice(&self.payload);
        Packet::new(self.local.ip(), self.remote.ip(), IPPROTO_TCP, l4)
    }
}

fn advertised_window(stack: &Stack, chnl: Option<crate::pool::SlotId>) -> u16 {
    chnl.and_then(|c| stack.chnl_objs.slot(c))
        .map(|c| c.rcv_space().min(u16::MAX as usize) as u16)
        .unwrap_or(0)
}

/// Emit everything queued on scheduled TCBs: unsent segments first, then a
/// pure ACK if one is owed and no emitted segment carried it.
pub fn tcp_output(stack: &mut Stack) -> Vec<TcpSegment> {
    let mut out = Vec::new();
    let now = stack.tcp_now();
    while let Some(slot) = stack.tcp.output_q.pop_front() {
        let chnl = stack.tcb_objs.slot(slot).and_then(|t| t.chnl);
        let window = advertised_window(stack, chnl);
        let Some(tcb) = stack.tcb_objs.slot_mut(slot) else {
            continue;
        };
        tcb.output_queued = false;
        let Some(key) = tcb.key else {
            continue;
        };
        if tcb.state == TcpState::Closed {
            continue;
        }
        let ack_flag = if tcb.state == TcpState::SynSent {
            TcpFlags::empty()
        } else {
            TcpFlags::ACK
        };
        let mut acked = false;
        for handle in tcb.sndq.iter() {
            let Some(seg) = stack.seg_objs.get_mut(handle) else {
                continue;
            };
            if seg.sent {
                continue;
            }
            seg.sent = true;
            seg.sent_at = now;
            let flags = seg.flags | ack_flag;
            out.push(TcpSegment {
                local: key.local,
                remote: key.remote,
                seq: seg.seq,
                ack: if ack_flag.is_empty() { 0 } else { tcb.rcv_nxt },
                flags,
                window,
                payload: seg.payload.clone(),
            });
            acked |= !ack_flag.is_empty();
        }
        if tcb.ack_pending && !acked {
            out.push(TcpSegment {
                local: key.local,
                remote: key.remote,
                seq: tcb.snd_nxt,
                ack: tcb.rcv_nxt,
                flags: TcpFlags::ACK,
                window,
                payload: Vec::new(),
            });
        }
        tcb.ack_pending = false;
    }
    out
}
