//! The TCP input node.
//!
//! Classification per packet:
//! - a header that does not frame is dropped whatever the tables hold;
//! - a 4-tuple match runs the state machine; in-order payload the channel
//!   has room for goes to the channel, everything else is consumed here;
//! - a SYN matching a listener opens a connection;
//! - anything else follows the stack's punt policy.
//!
//! The node never removes TCBs; a reset only marks the TCB closed and the
//! slow timeout reaps it.

use std::net::SocketAddr;

use tracing::debug;

use crate::chnl::Chnl;
use crate::graph::{InputNode, NextNode, NodeOutput, Packet};
use crate::pcb::{wildcard, Pcb};
use crate::pool::SlotId;
use crate::protosw::IPPROTO_TCP;
use crate::stack::{give_back, Stack};

use super::{
    alloc_conn, install, queue_segment, reap, schedule_output, seq_gt, seq_leq, ConnKey, Tcb,
    TcpFlags, TcpHeader, TcpState,
};

pub struct TcpInput;

impl InputNode for TcpInput {
    const NAME: &'static str = "tcp-input";

    fn process(stack: &mut Stack, pkts: &mut [Packet]) -> NodeOutput {
        let mut out = NodeOutput::with_capacity(pkts.len());
        for pkt in pkts.iter_mut() {
            let next = classify(stack, pkt);
            out.next.push(next);
        }
        out.check_output = !stack.tcp.output_q.is_empty();
        out
    }
}

fn classify(stack: &mut Stack, pkt: &mut Packet) -> NextNode {
    let Some(th) = TcpHeader::parse(&pkt.l4) else {
        stack.stats().malformed();
        return NextNode::PktDrop;
    };
    let key = ConnKey {
        local: SocketAddr::new(pkt.dst, th.dst_port),
        remote: SocketAddr::new(pkt.src, th.src_port),
    };
    let len = pkt.l4.len() - th.hdr_len;
    match stack.tcp.demux.get(&key).copied() {
        Some(slot) => match segment_arrives(stack, slot, &th, len) {
            Some(chnl) => {
                pkt.meta.chnl = Some(chnl);
                pkt.meta.payload_off = th.hdr_len as u16;
                NextNode::ChnlRecv
            }
            None => NextNode::PktDrop,
        },
        None => no_match(stack, key, &th),
    }
}

fn no_match(stack: &mut Stack, key: ConnKey, th: &TcpHeader) -> NextNode {
    let syn_only =
        th.flags.contains(TcpFlags::SYN) && !th.flags.intersects(TcpFlags::ACK | TcpFlags::RST);
    if syn_only {
        let listener = stack
            .tcp
            .listeners
            .get(&key.local)
            .or_else(|| stack.tcp.listeners.get(&wildcard(key.local)))
            .copied();
        if let Some(listener) = listener {
            if !passive_open(stack, listener, key, th) {
                debug!(?key, "connection refused, pools exhausted");
            }
            return NextNode::PktDrop;
        }
    }
    stack.punt_policy().next()
}

fn passive_open(stack: &mut Stack, listener: SlotId, key: ConnKey, th: &TcpHeader) -> bool {
    let Some(lchnl) = stack.tcb_objs.slot(listener).and_then(|t| t.chnl) else {
        return false;
    };
    let Some((rcv_hiwat, snd_hiwat, nodelay)) = stack
        .chnl_objs
        .slot(lchnl)
        .map(|c| (c.rcv_hiwat, c.snd_hiwat, c.nodelay))
    else {
        return false;
    };
    let Some(conn) = alloc_conn(stack) else {
        return false;
    };
    let now = stack.tcp_now();
    let iss: u32 = rand::random();
    let pcb = Pcb {
        proto: IPPROTO_TCP,
        local: Some(key.local),
        remote: Some(key.remote),
        ..Pcb::default()
    };
    let chnl = Chnl {
        proto: IPPROTO_TCP,
        parent: Some(lchnl),
        rcv_hiwat,
        snd_hiwat,
        nodelay,
        ..Chnl::default()
    };
    let tcb = Tcb {
        state: TcpState::SynRcvd,
        key: Some(key),
        listener: Some(listener),
        iss,
        snd_una: iss,
        snd_nxt: iss,
        snd_wnd: th.window,
        irs: th.seq,
        rcv_nxt: th.seq.wrapping_add(1),
        last_active: now,
        state_since: now,
        ..Tcb::default()
    };
    let (_, tid) = install(stack, conn, pcb, chnl, tcb);
    if !queue_segment(stack, tid, TcpFlags::SYN, Vec::new()) {
        reap(stack, tid);
        return false;
    }
    schedule_output(stack, tid);
    debug!(?key, tcb = %tid, "passive open");
    true
}

/// Run the state machine for a segment on a known connection. Returns the
/// channel the payload is delivered to, if any.
fn segment_arrives(stack: &mut Stack, slot: SlotId, th: &TcpHeader, len: usize) -> Option<SlotId> {
    let now = stack.tcp_now();
    let state = {
        let tcb = stack.tcb_objs.slot_mut(slot)?;
        tcb.last_active = now;
        tcb.state
    };
    if th.flags.contains(TcpFlags::RST) {
        on_reset(stack, slot, th);
        return None;
    }
    match state {
        TcpState::Closed | TcpState::Listen => return None,
        TcpState::SynSent => {
            on_syn_ack(stack, slot, th);
            return None;
        }
        _ => {}
    }
    if th.flags.contains(TcpFlags::SYN) {
        on_dup_syn(stack, slot, th);
        return None;
    }
    if !th.flags.contains(TcpFlags::ACK) || !on_ack(stack, slot, th) {
        return None;
    }
    let deliver = on_data(stack, slot, th, len);
    on_fin(stack, slot, th, len);
    if stack.tcb_objs.slot(slot).is_some_and(|t| t.ack_pending) {
        schedule_output(stack, slot);
    }
    deliver
}

fn on_reset(stack: &mut Stack, slot: SlotId, th: &TcpHeader) {
    let now = stack.tcp_now();
    let Some(tcb) = stack.tcb_objs.slot_mut(slot) else {
        return;
    };
    let acceptable = match tcb.state {
        TcpState::SynSent => th.flags.contains(TcpFlags::ACK) && th.ack == tcb.snd_nxt,
        s if s.is_synchronized() => th.seq == tcb.rcv_nxt,
        _ => false,
    };
    if !acceptable {
        return;
    }
    tcb.set_state(TcpState::Closed, now);
    let chnl = tcb.chnl;
    if let Some(c) = chnl.and_then(|c| stack.chnl_objs.slot_mut(c)) {
        c.reset = true;
        c.eof = true;
    }
    debug!(tcb = %slot, "connection reset by peer");
}

fn on_syn_ack(stack: &mut Stack, slot: SlotId, th: &TcpHeader) {
    if !th.flags.contains(TcpFlags::SYN | TcpFlags::ACK) {
        return;
    }
    let now = stack.tcp_now();
    let Some(tcb) = stack.tcb_objs.slot_mut(slot) else {
        return;
    };
    if th.ack != tcb.snd_nxt {
        return;
    }
    tcb.irs = th.seq;
    tcb.rcv_nxt = th.seq.wrapping_add(1);
    tcb.snd_wnd = th.window;
    tcb.ack_pending = true;
    tcb.set_state(TcpState::Established, now);
    release_acked(stack, slot, th.ack);
    schedule_output(stack, slot);
    debug!(tcb = %slot, "active open established");
}

fn on_dup_syn(stack: &mut Stack, slot: SlotId, th: &TcpHeader) {
    let Some(tcb) = stack.tcb_objs.slot_mut(slot) else {
        return;
    };
    if tcb.state == TcpState::SynRcvd && th.seq == tcb.irs {
        // Our SYN-ACK was lost; send it again.
        for h in tcb.sndq.iter() {
            if let Some(seg) = stack.seg_objs.get_mut(h) {
                seg.sent = false;
            }
        }
    } else {
        tcb.ack_pending = true;
    }
    schedule_output(stack, slot);
}

/// Release every fully acknowledged segment at the head of the send queue.
fn release_acked(stack: &mut Stack, slot: SlotId, ack: u32) -> usize {
    let Some(tcb) = stack.tcb_objs.slot_mut(slot) else {
        return 0;
    };
    tcb.snd_una = ack;
    tcb.backoff = 0;
    let mut released = 0;
    while let Some(front) = tcb.sndq.front() {
        let done = stack
            .seg_objs
            .get(front)
            .map_or(true, |seg| seq_leq(seg.seq.wrapping_add(seg.seq_len()), ack));
        if !done {
            break;
        }
        if let Some(h) = tcb.sndq.pop_front() {
            give_back(&mut stack.seg_objs, h);
            released += 1;
        }
    }
    released
}

/// ACK processing for synchronized states. Returns false when the segment
/// must not be processed further.
fn on_ack(stack: &mut Stack, slot: SlotId, th: &TcpHeader) -> bool {
    let now = stack.tcp_now();
    let Some(tcb) = stack.tcb_objs.slot_mut(slot) else {
        return false;
    };
    let (state, snd_una, snd_nxt) = (tcb.state, tcb.snd_una, tcb.snd_nxt);
    if seq_gt(th.ack, snd_nxt) {
        tcb.ack_pending = true;
        schedule_output(stack, slot);
        return false;
    }
    if state == TcpState::SynRcvd && !seq_gt(th.ack, snd_una) {
        return false;
    }
    tcb.snd_wnd = th.window;
    let released = if seq_gt(th.ack, snd_una) {
        release_acked(stack, slot, th.ack)
    } else {
        0
    };

    let Some(tcb) = stack.tcb_objs.slot_mut(slot) else {
        return false;
    };
    let all_acked = tcb.snd_una == tcb.snd_nxt;
    let has_unsent = tcb
        .sndq
        .iter()
        .any(|h| stack.seg_objs.get(h).is_some_and(|s| !s.sent));
    match state {
        TcpState::SynRcvd => {
            tcb.set_state(TcpState::Established, now);
            established_passive(stack, slot);
        }
        TcpState::FinWait1 if all_acked => tcb.set_state(TcpState::FinWait2, now),
        TcpState::Closing if all_acked => tcb.set_state(TcpState::TimeWait, now),
        TcpState::LastAck if all_acked => {
            tcb.set_state(TcpState::Closed, now);
            return false;
        }
        _ => {}
    }
    // Data held back while earlier segments were in flight.
    if released > 0 && has_unsent {
        schedule_output(stack, slot);
    }
    true
}

/// A passively opened connection completed its handshake: queue it on the
/// listener for accept.
fn established_passive(stack: &mut Stack, slot: SlotId) {
    let now = stack.tcp_now();
    let Some((listener, chnl, local)) = stack
        .tcb_objs
        .slot(slot)
        .map(|t| (t.listener, t.chnl, t.key.map(|k| k.local)))
    else {
        return;
    };
    // The listener slot may have been reused since the SYN arrived.
    let lchnl = listener
        .filter(|l| stack.tcbs.contains_key(l))
        .and_then(|l| stack.tcb_objs.slot(l))
        .filter(|l| l.state == TcpState::Listen)
        .filter(|l| {
            local.is_some_and(|a| l.listen_addr == Some(a) || l.listen_addr == Some(wildcard(a)))
        })
        .and_then(|l| l.chnl);
    match (lchnl.and_then(|c| stack.chnl_objs.slot_mut(c)), chnl) {
        (Some(parent), Some(child)) => parent.accept_q.push_back(child),
        _ => {
            // Listener went away during the handshake.
            if let Some(tcb) = stack.tcb_objs.slot_mut(slot) {
                tcb.set_state(TcpState::Closed, now);
            }
        }
    }
}

fn on_data(stack: &mut Stack, slot: SlotId, th: &TcpHeader, len: usize) -> Option<SlotId> {
    if len == 0 {
        return None;
    }
    let tcb = stack.tcb_objs.slot_mut(slot)?;
    if !tcb.state.can_receive() {
        return None;
    }
    tcb.ack_pending = true;
    if th.seq != tcb.rcv_nxt {
        // Out of order or duplicate: answer with the ACK we owe.
        return None;
    }
    let chnl = tcb.chnl?;
    let c = stack.chnl_objs.slot_mut(chnl)?;
    if c.rcv_space() < len {
        return None;
    }
    c.rcv_pending += len;
    tcb.rcv_nxt = tcb.rcv_nxt.wrapping_add(len as u32);
    Some(chnl)
}

fn on_fin(stack: &mut Stack, slot: SlotId, th: &TcpHeader, len: usize) {
    if !th.flags.contains(TcpFlags::FIN) {
        return;
    }
    let now = stack.tcp_now();
    let Some(tcb) = stack.tcb_objs.slot_mut(slot) else {
        return;
    };
    match tcb.state {
        TcpState::Established | TcpState::FinWait1 | TcpState::FinWait2 => {}
        TcpState::CloseWait | TcpState::Closing | TcpState::LastAck | TcpState::TimeWait => {
            // Retransmitted FIN.
            tcb.ack_pending = true;
            return;
        }
        _ => return,
    }
    if th.seq.wrapping_add(len as u32) != tcb.rcv_nxt {
        return;
    }
    tcb.rcv_nxt = tcb.rcv_nxt.wrapping_add(1);
    tcb.ack_pending = true;
    let next = match tcb.state {
        TcpState::Established => TcpState::CloseWait,
        TcpState::FinWait1 if tcb.snd_una == tcb.snd_nxt => TcpState::TimeWait,
        TcpState::FinWait1 => TcpState::Closing,
        _ => TcpState::TimeWait,
    };
    tcb.set_state(next, now);
    let chnl = tcb.chnl;
    if let Some(c) = chnl.and_then(|c| stack.chnl_objs.slot_mut(c)) {
        c.eof = true;
    }
    debug!(tcb = %slot, state = ?next, "peer closed");
}
