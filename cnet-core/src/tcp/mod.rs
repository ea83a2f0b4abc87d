//! TCP: control blocks, the input node, output and the slow-timeout sweep.

mod header;
mod input;
mod output;
mod timer;

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;

use tracing::debug;

pub use header::{seq_geq, seq_gt, seq_leq, seq_lt, TcpFlags, TcpHeader, TCP_HDR_LEN};
pub use input::TcpInput;
pub use output::{tcp_output, TcpSegment};
pub use timer::slow_timeout;

use crate::chnl::{self, Chnl};
use crate::pcb::Pcb;
use crate::pool::{Handle, SlotId};
use crate::protosw::CtlReport;
use crate::stack::{give_back, Stack};

/// Largest payload put in one segment.
pub const TCP_MSS: usize = 1460;

/// Connection 4-tuple as seen from this stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnKey {
    pub local: SocketAddr,
    pub remote: SocketAddr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TcpState {
    #[default]
    Closed,
    Listen,
    SynSent,
    SynRcvd,
    Established,
    FinWait1,
    FinWait2,
    CloseWait,
    Closing,
    LastAck,
    TimeWait,
}

impl TcpState {
    /// States that carry a synchronized sequence space.
    pub fn is_synchronized(self) -> bool {
        !matches!(self, TcpState::Closed | TcpState::Listen | TcpState::SynSent)
    }

    /// States in which arriving payload is accepted.
    pub fn can_receive(self) -> bool {
        matches!(
            self,
            TcpState::Established | TcpState::FinWait1 | TcpState::FinWait2
        )
    }

    /// States in which the application may queue data.
    pub fn can_send(self) -> bool {
        matches!(self, TcpState::Established | TcpState::CloseWait)
    }
}

/// TCP control block.
#[derive(Debug, Default)]
pub struct Tcb {
    pub state: TcpState,
    /// Set for connections; listeners have `listen_addr` instead.
    pub key: Option<ConnKey>,
    pub listen_addr: Option<SocketAddr>,
    pub pcb: Option<SlotId>,
    pub chnl: Option<SlotId>,
    /// Listening TCB that spawned this one.
    pub listener: Option<SlotId>,
    pub iss: u32,
    pub snd_una: u32,
    pub snd_nxt: u32,
    pub snd_wnd: u16,
    pub irs: u32,
    pub rcv_nxt: u32,
    /// Segments not yet acknowledged, in sequence order.
    pub sndq: VecDeque<Handle<Segment>>,
    pub ack_pending: bool,
    pub output_queued: bool,
    /// `tcp_now` of the last segment received.
    pub last_active: u32,
    /// `tcp_now` of the last state change.
    pub state_since: u32,
    pub backoff: u8,
}

impl Tcb {
    pub(crate) fn set_state(&mut self, state: TcpState, now: u32) {
        self.state = state;
        self.state_since = now;
    }
}

/// A queued outbound segment.
#[derive(Debug, Default)]
pub struct Segment {
    pub seq: u32,
    pub flags: TcpFlags,
    pub payload: Vec<u8>,
    pub sent: bool,
    pub sent_at: u32,
}

impl Segment {
    /// Sequence space consumed: payload plus one for each of SYN and FIN.
    pub fn seq_len(&self) -> u32 {
        let mut n = self.payload.len() as u32;
        if self.flags.contains(TcpFlags::SYN) {
            n += 1;
        }
        if self.flags.contains(TcpFlags::FIN) {
            n += 1;
        }
        n
    }
}

/// Per-stack TCP state.
#[derive(Debug)]
pub struct TcpEntry {
    pub(crate) demux: HashMap<ConnKey, SlotId>,
    pub(crate) listeners: HashMap<SocketAddr, SlotId>,
    /// TCBs with something to send, in scheduling order.
    pub(crate) output_q: VecDeque<SlotId>,
    pub(crate) mss: usize,
}

impl Default for TcpEntry {
    fn default() -> Self {
        Self {
            demux: HashMap::new(),
            listeners: HashMap::new(),
            output_q: VecDeque::new(),
            mss: TCP_MSS,
        }
    }
}

/// Freshly acquired objects for one connection.
pub(crate) struct NewConn {
    pub chnl: Handle<Chnl>,
    pub pcb: Handle<Pcb>,
    pub tcb: Handle<Tcb>,
}

/// Acquire channel, PCB and TCB together. On exhaustion nothing stays
/// allocated.
pub(crate) fn alloc_conn(stack: &mut Stack) -> Option<NewConn> {
    let chnl = stack.chnl_objs.acquire();
    let pcb = stack.pcb_objs.acquire();
    let tcb = stack.tcb_objs.acquire();
    match (chnl, pcb, tcb) {
        (Some(chnl), Some(pcb), Some(tcb)) => Some(NewConn { chnl, pcb, tcb }),
        (chnl, pcb, tcb) => {
            if let Some(h) = chnl {
                give_back(&mut stack.chnl_objs, h);
            }
            if let Some(h) = pcb {
                give_back(&mut stack.pcb_objs, h);
            }
            if let Some(h) = tcb {
                give_back(&mut stack.tcb_objs, h);
            }
            stack.stats().pool_exhausted();
            None
        }
    }
}

/// Wire up the cross references of a new connection and insert it into the
/// stack's collections. Returns the channel and TCB slots.
pub(crate) fn install(
    stack: &mut Stack,
    conn: NewConn,
    mut pcb: Pcb,
    mut chnl: Chnl,
    mut tcb: Tcb,
) -> (SlotId, SlotId) {
    let (cid, pid, tid) = (conn.chnl.id(), conn.pcb.id(), conn.tcb.id());
    pcb.chnl = Some(cid);
    pcb.tcb = Some(tid);
    chnl.pcb = Some(pid);
    tcb.pcb = Some(pid);
    tcb.chnl = Some(cid);
    if let Some(key) = tcb.key {
        stack.tcp.demux.insert(key, tid);
    }
    if let Some(p) = stack.pcb_objs.get_mut(&conn.pcb) {
        *p = pcb;
    }
    if let Some(c) = stack.chnl_objs.get_mut(&conn.chnl) {
        *c = chnl;
    }
    if let Some(t) = stack.tcb_objs.get_mut(&conn.tcb) {
        *t = tcb;
    }
    stack.pcbs.insert(pid, conn.pcb);
    stack.chnls.insert(cid, conn.chnl);
    stack.tcbs.insert(tid, conn.tcb);
    (cid, tid)
}

/// Put a TCB on the output queue once.
pub(crate) fn schedule_output(stack: &mut Stack, slot: SlotId) {
    if let Some(tcb) = stack.tcb_objs.slot_mut(slot) {
        if !tcb.output_queued {
            tcb.output_queued = true;
            stack.tcp.output_q.push_back(slot);
        }
    }
}

/// Queue a segment carrying `flags` and `payload` at `snd_nxt`. Returns
/// false if the segment pool is exhausted.
pub(crate) fn queue_segment(
    stack: &mut Stack,
    slot: SlotId,
    flags: TcpFlags,
    payload: Vec<u8>,
) -> bool {
    let Some(handle) = stack.seg_objs.acquire() else {
        stack.stats().pool_exhausted();
        return false;
    };
    let Some(tcb) = stack.tcb_objs.slot_mut(slot) else {
        give_back(&mut stack.seg_objs, handle);
        return false;
    };
    if let Some(seg) = stack.seg_objs.get_mut(&handle) {
        seg.seq = tcb.snd_nxt;
        seg.flags = flags;
        seg.payload = payload;
        tcb.snd_nxt = tcb.snd_nxt.wrapping_add(seg.seq_len());
    }
    tcb.sndq.push_back(handle);
    true
}

/// Remove a TCB and everything hanging off it. Channels the application
/// holds are only marked EOF; unaccepted ones go back to the pool.
pub(crate) fn reap(stack: &mut Stack, slot: SlotId) -> bool {
    let Some(handle) = stack.tcbs.remove(&slot) else {
        return false;
    };
    let parts = stack.tcb_objs.get_mut(&handle).map(|tcb| {
        (
            tcb.key,
            tcb.listen_addr,
            tcb.state,
            tcb.pcb,
            tcb.chnl,
            std::mem::take(&mut tcb.sndq),
        )
    });
    if let Some((key, listen_addr, state, pcb, chnl, sndq)) = parts {
        for seg in sndq {
            give_back(&mut stack.seg_objs, seg);
        }
        if let Some(key) = key {
            if stack.tcp.demux.get(&key) == Some(&slot) {
                stack.tcp.demux.remove(&key);
            }
        }
        if let Some(addr) = listen_addr {
            if stack.tcp.listeners.get(&addr) == Some(&slot) {
                stack.tcp.listeners.remove(&addr);
            }
        }
        stack.tcp.output_q.retain(|&s| s != slot);
        if let Some(p) = pcb {
            if let Some(h) = stack.pcbs.remove(&p) {
                give_back(&mut stack.pcb_objs, h);
            }
        }
        if let Some(c) = chnl {
            chnl::conn_gone(stack, c);
        }
        debug!(tcb = %slot, ?key, ?state, "tcb reaped");
    }
    give_back(&mut stack.tcb_objs, handle);
    true
}

/// Reap every TCB, listeners included.
pub fn drain(stack: &mut Stack) -> CtlReport {
    let slots: Vec<SlotId> = stack.tcbs.keys().copied().collect();
    let mut report = CtlReport::default();
    for slot in slots {
        if reap(stack, slot) {
            report.reaped += 1;
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chnl::ChnlId;
    use crate::config::{CnetConfig, ProtoName};
    use crate::graph::{InputNode, NextNode, Packet};
    use crate::registry::Registry;

    const SRV: &str = "10.1.0.1:80";
    const CLI: &str = "10.1.0.9:50000";

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn pkt(from: &str, to: &str, seq: u32, ack: u32, flags: TcpFlags, payload: &[u8]) -> Packet {
        TcpSegment {
            local: addr(from),
            remote: addr(to),
            seq,
            ack,
            flags,
            window: 4096,
            payload: payload.to_vec(),
        }
        .to_packet()
    }

    fn bound(reg: &Registry, cfg: CnetConfig) -> Stack {
        let mut stk = reg.initialize(&cfg).unwrap().pop().unwrap();
        stk.bind_current_thread().unwrap();
        stk
    }

    /// Listener on SRV plus one established connection from CLI. Returns the
    /// listening channel and the server's next sequence number.
    fn established(stk: &mut Stack) -> (ChnlId, u32) {
        let l = stk.chnl_listen(addr(SRV)).unwrap();
        let d = stk
            .input(vec![pkt(CLI, SRV, 1000, 0, TcpFlags::SYN, b"")])
            .unwrap();
        assert_eq!(d.dropped, 1);
        let synack = &d.output[0];
        assert_eq!(synack.flags, TcpFlags::SYN | TcpFlags::ACK);
        assert_eq!(synack.ack, 1001);
        let srv_nxt = synack.seq.wrapping_add(1);
        let d = stk
            .input(vec![pkt(CLI, SRV, 1001, srv_nxt, TcpFlags::ACK, b"")])
            .unwrap();
        assert_eq!(d.dropped, 1);
        assert!(d.output.is_empty());
        (l, srv_nxt)
    }

    #[test]
    fn passive_open_then_delivery() {
        let reg = Registry::new();
        let mut stk = bound(&reg, CnetConfig::with_cores(&[0]));
        let (l, srv_nxt) = established(&mut stk);
        let c = stk.chnl_accept(l).unwrap().unwrap();
        assert_eq!(
            stk.chnl_info(c).unwrap().tcp_state,
            Some(TcpState::Established)
        );

        let mut batch = vec![pkt(CLI, SRV, 1001, srv_nxt, TcpFlags::ACK, b"ping")];
        let out = TcpInput::process(&mut stk, &mut batch);
        assert_eq!(out.next, vec![NextNode::ChnlRecv]);
        assert!(out.check_output);
        assert_eq!(batch[0].meta.chnl, Some(c.slot()));
        assert_eq!(batch[0].payload(), b"ping");

        let d = stk
            .input(vec![pkt(CLI, SRV, 1005, srv_nxt, TcpFlags::ACK | TcpFlags::PSH, b"pong")])
            .unwrap();
        assert_eq!(d.delivered, 1);
        assert_eq!(d.output.len(), 1);
        assert_eq!(d.output[0].ack, 1009);
        assert_eq!(d.output[0].flags, TcpFlags::ACK);
        // Only the packet that went through the full graph is buffered.
        assert_eq!(stk.chnl_read(c, 64).unwrap(), b"pong".to_vec());
        assert_eq!(stk.handle().stats().deliveries, 1);
    }

    #[test]
    fn closing_listener_drops_half_open_connections() {
        let reg = Registry::new();
        let mut stk = bound(&reg, CnetConfig::with_cores(&[0]));
        let old = stk.chnl_listen(addr(SRV)).unwrap();
        let d = stk
            .input(vec![pkt(CLI, SRV, 1000, 0, TcpFlags::SYN, b"")])
            .unwrap();
        let srv_nxt = d.output[0].seq.wrapping_add(1);
        assert_eq!(stk.tcb_count(), 2);

        stk.chnl_close(old).unwrap();
        assert_eq!(stk.tcb_count(), 0);
        assert_eq!(stk.pools_in_use().total(), 0);

        // A new listener elsewhere may take the freed slots.
        let new = stk.chnl_listen(addr("10.1.0.1:8080")).unwrap();
        let d = stk
            .input(vec![pkt(CLI, SRV, 1001, srv_nxt, TcpFlags::ACK, b"")])
            .unwrap();
        assert_eq!(d.dropped, 1);
        assert_eq!(stk.chnl_accept(new).unwrap(), None);
        assert_eq!(stk.tcb_count(), 1);
    }

    #[test]
    fn handshake_completes_only_on_its_own_listener() {
        let reg = Registry::new();
        let mut stk = bound(&reg, CnetConfig::with_cores(&[0]));
        stk.chnl_listen(addr(SRV)).unwrap();
        let other = stk.chnl_listen(addr("10.1.0.1:8080")).unwrap();
        let d = stk
            .input(vec![pkt(CLI, SRV, 1000, 0, TcpFlags::SYN, b"")])
            .unwrap();
        let srv_nxt = d.output[0].seq.wrapping_add(1);

        // Point the half-open connection at a listener for another port.
        let other_tcb = stk.tcp.listeners[&addr("10.1.0.1:8080")];
        let child = stk.tcp.demux[&ConnKey {
            local: addr(SRV),
            remote: addr(CLI),
        }];
        stk.tcb_objs.slot_mut(child).unwrap().listener = Some(other_tcb);

        stk.input(vec![pkt(CLI, SRV, 1001, srv_nxt, TcpFlags::ACK, b"")])
            .unwrap();
        assert_eq!(stk.chnl_accept(other).unwrap(), None);
        assert_eq!(stk.tcb_objs.slot(child).unwrap().state, TcpState::Closed);
    }

    #[test]
    fn malformed_drops_whatever_the_table_holds() {
        let reg = Registry::new();
        let mut cfg = CnetConfig::with_cores(&[0]);
        cfg.protocols.push(ProtoName::Raw);
        let mut stk = bound(&reg, cfg);
        let (_, srv_nxt) = established(&mut stk);

        let mut truncated = pkt(CLI, SRV, 1001, srv_nxt, TcpFlags::ACK, b"");
        truncated.l4.truncate(TCP_HDR_LEN - 1);
        let mut bad_offset = pkt(CLI, SRV, 1001, srv_nxt, TcpFlags::ACK, b"");
        bad_offset.l4[12] = 15 << 4;
        let mut stray = pkt("10.9.9.9:1", SRV, 1, 1, TcpFlags::ACK, b"");
        stray.l4.truncate(8);

        let mut batch = vec![truncated, bad_offset, stray];
        let out = TcpInput::process(&mut stk, &mut batch);
        assert_eq!(out.next, vec![NextNode::PktDrop; 3]);
        assert_eq!(stk.handle().stats().malformed, 3);
    }

    #[test]
    fn unmatched_packet_follows_raw_presence() {
        let stray = || vec![pkt("10.9.9.9:1234", SRV, 5, 5, TcpFlags::ACK, b"")];

        let reg = Registry::new();
        let mut plain = bound(&reg, CnetConfig::with_cores(&[0]));
        let out = TcpInput::process(&mut plain, &mut stray());
        assert_eq!(out.next, vec![NextNode::PktDrop]);

        let mut cfg = CnetConfig::with_cores(&[1]);
        cfg.protocols.push(ProtoName::Raw);
        let mut with_raw = reg.initialize(&cfg).unwrap().pop().unwrap();
        std::thread::scope(|s| {
            s.spawn(|| {
                with_raw.bind_current_thread().unwrap();
                let out = TcpInput::process(&mut with_raw, &mut stray());
                assert_eq!(out.next, vec![NextNode::PktPunt]);
                // A SYN nobody listens for is not ours either.
                let mut syn = vec![pkt("10.9.9.9:1234", SRV, 5, 0, TcpFlags::SYN, b"")];
                let out = TcpInput::process(&mut with_raw, &mut syn);
                assert_eq!(out.next, vec![NextNode::PktPunt]);
            });
        });
    }

    #[test]
    fn classification_is_deterministic() {
        let reg = Registry::new();
        let mut stk = bound(&reg, CnetConfig::with_cores(&[0]));
        let (_, srv_nxt) = established(&mut stk);
        let mut short = pkt(CLI, SRV, 1001, srv_nxt, TcpFlags::ACK, b"");
        short.l4.truncate(10);
        let batch = vec![
            short,
            pkt("10.9.9.9:1234", SRV, 5, 5, TcpFlags::ACK, b""),
            // Out of order: answered with a duplicate ACK, not delivered.
            pkt(CLI, SRV, 90_000, srv_nxt, TcpFlags::ACK, b"later"),
            pkt(CLI, SRV, 1001, srv_nxt, TcpFlags::ACK, b""),
        ];
        let first = TcpInput::process(&mut stk, &mut batch.clone());
        let second = TcpInput::process(&mut stk, &mut batch.clone());
        assert_eq!(first.next, second.next);
        assert_eq!(first.next, vec![NextNode::PktDrop; 4]);
    }

    #[test]
    fn reset_marks_closed_and_sweep_reaps() {
        let reg = Registry::new();
        let mut stk = bound(&reg, CnetConfig::with_cores(&[0]));
        let (l, srv_nxt) = established(&mut stk);
        let c = stk.chnl_accept(l).unwrap().unwrap();
        let d = stk
            .input(vec![pkt(CLI, SRV, 1001, srv_nxt, TcpFlags::RST, b"")])
            .unwrap();
        assert_eq!(d.dropped, 1);
        // The input node never removes entries.
        assert_eq!(stk.tcb_count(), 2);
        let info = stk.chnl_info(c).unwrap();
        assert_eq!(info.tcp_state, Some(TcpState::Closed));
        assert!(info.reset && info.eof);

        let mut reaped = 0;
        for _ in 0..5 {
            reaped += stk.tick().unwrap().ctl.reaped;
        }
        assert_eq!(reaped, 1);
        assert_eq!(stk.tcb_count(), 1);
        // Accepted channel stays with the application until it closes it.
        assert!(stk.chnl_info(c).unwrap().eof);
        stk.chnl_close(c).unwrap();
        assert_eq!(stk.pools_in_use().chnls, 1);
    }

    #[test]
    fn idle_tcb_expires_exactly_once() {
        let reg = Registry::new();
        let mut cfg = CnetConfig::with_cores(&[0]);
        cfg.timers.slow_timeout_ticks = 1;
        cfg.timers.idle_timeout = 3;
        let mut stk = bound(&reg, cfg);
        established(&mut stk);
        let before = stk.pools_in_use();
        assert_eq!(stk.tcb_count(), 2);

        for _ in 0..2 {
            assert_eq!(stk.tick().unwrap().ctl.expired, 0);
        }
        assert_eq!(stk.tcb_count(), 2);
        assert_eq!(stk.tick().unwrap().ctl.expired, 1);
        assert_eq!(stk.pools_in_use().tcbs, before.tcbs - 1);
        assert_eq!(stk.tcb_count(), 1);

        // The listener never idles out.
        for _ in 0..10 {
            stk.tick().unwrap();
        }
        assert_eq!(stk.tcb_count(), 1);
        assert_eq!(stk.handle().stats().expired, 1);
    }

    #[test]
    fn silence_triggers_retransmit_then_expiry() {
        let reg = Registry::new();
        let mut cfg = CnetConfig::with_cores(&[0]);
        cfg.timers.slow_timeout_ticks = 1;
        cfg.timers.rexmt_base = 2;
        cfg.timers.max_rexmt = 1;
        let mut stk = bound(&reg, cfg);
        let c = stk.chnl_connect(addr(CLI), addr(SRV)).unwrap();
        let syn = stk.output().unwrap();
        assert_eq!(syn.len(), 1);
        assert_eq!(syn[0].flags, TcpFlags::SYN);

        assert!(stk.tick().unwrap().output.is_empty());
        let r = stk.tick().unwrap();
        assert_eq!(r.ctl.retransmitted, 1);
        assert_eq!(r.output, syn);

        // Backed off: the next attempt would be four slow ticks later, but
        // the retry budget is spent.
        let mut expired = 0;
        for _ in 0..4 {
            expired += stk.tick().unwrap().ctl.expired;
        }
        assert_eq!(expired, 1);
        let info = stk.chnl_info(c).unwrap();
        assert!(info.reset);
        assert_eq!(info.tcp_state, None);
        assert_eq!(stk.handle().stats().retransmits, 1);
    }

    #[test]
    fn exhausted_pool_refuses_connection() {
        let reg = Registry::new();
        let mut cfg = CnetConfig::with_cores(&[0]);
        cfg.pools.tcbs = Some(1);
        let mut stk = bound(&reg, cfg);
        stk.chnl_listen(addr(SRV)).unwrap();
        let before = stk.pools_in_use();
        let d = stk
            .input(vec![pkt(CLI, SRV, 1000, 0, TcpFlags::SYN, b"")])
            .unwrap();
        assert_eq!(d.dropped, 1);
        assert!(d.output.is_empty());
        assert_eq!(stk.pools_in_use(), before);
        assert_eq!(stk.handle().stats().pool_exhausted, 1);
    }

    #[test]
    fn stop_returns_everything() {
        let reg = Registry::new();
        let mut stk = bound(&reg, CnetConfig::with_cores(&[0]));
        let (l, _) = established(&mut stk);
        let _accepted = stk.chnl_accept(l).unwrap();
        stk.chnl_connect(addr("10.1.0.1:41000"), addr("10.1.0.7:22"))
            .unwrap();
        assert!(stk.pools_in_use().total() > 0);
        let handle = std::sync::Arc::clone(stk.handle());
        let report = stk.stop().unwrap();
        assert_eq!(report.drained.reaped, 3);
        assert_eq!(report.leaked.total(), 0);
        assert_eq!(report.available, report.capacity);
        assert!(!handle.is_running());
        assert!(reg.lookup_by_core(0).is_none());
    }
}
