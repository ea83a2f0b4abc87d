//! Channel layer boundary: the application side of a connection.
//!
//! Channels are pool objects owned by the stack. The application refers to
//! them by [`ChnlId`] and drives them through the `chnl_*` methods on
//! [`Stack`], all of which are data-path operations and must run on the
//! stack's bound thread.

use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;

use tracing::debug;

use crate::graph::Packet;
use crate::pcb::Pcb;
use crate::pool::SlotId;
use crate::protosw::{ProtoSwTable, Protocol, IPPROTO_TCP, IPPROTO_UDP};
use crate::stack::{give_back, Stack, StackError};
use crate::tcp::{
    self, alloc_conn, install, queue_segment, reap, schedule_output, ConnKey, Tcb, TcpFlags,
    TcpState,
};
use crate::udp;

pub const CHNL_RCVBUF_DEFAULT: usize = 64 * 1024;
pub const CHNL_SNDBUF_DEFAULT: usize = 64 * 1024;

/// Application handle for a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChnlId(pub(crate) SlotId);

impl ChnlId {
    pub fn slot(self) -> SlotId {
        self.0
    }
}

impl fmt::Display for ChnlId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chnl{}", self.0)
    }
}

#[derive(Debug)]
pub struct Chnl {
    pub proto: u8,
    pub pcb: Option<SlotId>,
    /// Listening channel this one is queued on until accepted.
    pub parent: Option<SlotId>,
    /// Held by the application (created by it, or accepted).
    pub owned: bool,
    pub listening: bool,
    pub eof: bool,
    pub reset: bool,
    pub nodelay: bool,
    /// Received payloads, one entry per delivered packet.
    pub rcv: VecDeque<Vec<u8>>,
    pub rcv_cc: usize,
    /// Bytes classified for delivery but not yet appended.
    pub rcv_pending: usize,
    pub rcv_hiwat: usize,
    pub snd_hiwat: usize,
    pub accept_q: VecDeque<SlotId>,
}

impl Default for Chnl {
    fn default() -> Self {
        Self {
            proto: 0,
            pcb: None,
            parent: None,
            owned: false,
            listening: false,
            eof: false,
            reset: false,
            nodelay: false,
            rcv: VecDeque::new(),
            rcv_cc: 0,
            rcv_pending: 0,
            rcv_hiwat: CHNL_RCVBUF_DEFAULT,
            snd_hiwat: CHNL_SNDBUF_DEFAULT,
            accept_q: VecDeque::new(),
        }
    }
}

impl Chnl {
    /// Room left in the receive buffer.
    pub fn rcv_space(&self) -> usize {
        self.rcv_hiwat
            .saturating_sub(self.rcv_cc)
            .saturating_sub(self.rcv_pending)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptLevel {
    Socket,
    Tcp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptName {
    RcvBuf,
    SndBuf,
    TcpNoDelay,
}

impl OptName {
    pub fn level(self) -> OptLevel {
        match self {
            OptName::RcvBuf | OptName::SndBuf => OptLevel::Socket,
            OptName::TcpNoDelay => OptLevel::Tcp,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChnlOpt {
    RcvBuf(usize),
    SndBuf(usize),
    TcpNoDelay(bool),
}

impl ChnlOpt {
    pub fn name(self) -> OptName {
        match self {
            ChnlOpt::RcvBuf(_) => OptName::RcvBuf,
            ChnlOpt::SndBuf(_) => OptName::SndBuf,
            ChnlOpt::TcpNoDelay(_) => OptName::TcpNoDelay,
        }
    }
}

/// Option levels this instance answers to; protocol levels are present only
/// when the protocol is bound.
#[derive(Debug, Clone)]
pub struct ChnlOptTable {
    levels: Vec<OptLevel>,
}

impl ChnlOptTable {
    pub fn new(protosw: &ProtoSwTable) -> Self {
        let mut levels = vec![OptLevel::Socket];
        if protosw.contains(Protocol::Tcp) {
            levels.push(OptLevel::Tcp);
        }
        Self { levels }
    }

    pub fn supports(&self, level: OptLevel) -> bool {
        self.levels.contains(&level)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChnlError {
    #[error(transparent)]
    Stack(#[from] StackError),
    #[error("unknown channel {0}")]
    Unknown(ChnlId),
    #[error("protocol {0} not configured")]
    NoProtocol(&'static str),
    #[error("address {0} in use")]
    AddrInUse(SocketAddr),
    #[error("no buffers available")]
    NoBufs,
    #[error("{0} is not in a state that allows this")]
    InvalidState(ChnlId),
    #[error("option {0:?} not supported on this channel")]
    UnsupportedOpt(OptName),
    #[error("invalid value for option {0:?}")]
    InvalidOpt(OptName),
}

/// What the application can see of a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChnlInfo {
    pub proto: u8,
    pub listening: bool,
    pub readable: usize,
    pub pending_accepts: usize,
    pub eof: bool,
    pub reset: bool,
    pub local: Option<SocketAddr>,
    pub remote: Option<SocketAddr>,
    pub tcp_state: Option<TcpState>,
}

/// The channel receive node: append each payload to its channel. Returns
/// `(delivered, refused)`; a packet whose channel vanished since
/// classification is refused.
pub(crate) fn chnl_recv(stack: &mut Stack, pkts: Vec<Packet>) -> (usize, usize) {
    let mut delivered = 0;
    let mut refused = 0;
    for pkt in pkts {
        let off = pkt.meta.payload_off as usize;
        let target = pkt
            .meta
            .chnl
            .filter(|c| stack.chnls.contains_key(c))
            .and_then(|c| stack.chnl_objs.slot_mut(c));
        let Some(c) = target else {
            refused += 1;
            continue;
        };
        let mut data = pkt.l4;
        data.drain(..off.min(data.len()));
        c.rcv_pending = c.rcv_pending.saturating_sub(data.len());
        c.rcv_cc += data.len();
        c.rcv.push_back(data);
        delivered += 1;
    }
    (delivered, refused)
}

/// The transport state behind a channel is gone. Application-held channels
/// see EOF; unaccepted ones are released.
pub(crate) fn conn_gone(stack: &mut Stack, slot: SlotId) {
    let Some(c) = stack.chnl_objs.slot_mut(slot) else {
        return;
    };
    c.pcb = None;
    c.eof = true;
    if c.owned {
        return;
    }
    let parent = c.parent;
    if let Some(p) = parent.and_then(|p| stack.chnl_objs.slot_mut(p)) {
        p.accept_q.retain(|&s| s != slot);
    }
    if let Some(h) = stack.chnls.remove(&slot) {
        give_back(&mut stack.chnl_objs, h);
    }
}

impl Stack {
    fn chnl_ref(&self, id: ChnlId) -> Result<&Chnl, ChnlError> {
        self.chnls
            .get(&id.0)
            .and_then(|h| self.chnl_objs.get(h))
            .ok_or(ChnlError::Unknown(id))
    }

    fn chnl_mut(&mut self, id: ChnlId) -> Result<&mut Chnl, ChnlError> {
        let h = self.chnls.get(&id.0).ok_or(ChnlError::Unknown(id))?;
        self.chnl_objs.get_mut(h).ok_or(ChnlError::Unknown(id))
    }

    fn chnl_tcb(&self, id: ChnlId) -> Result<SlotId, ChnlError> {
        let c = self.chnl_ref(id)?;
        if c.proto != IPPROTO_TCP {
            return Err(ChnlError::InvalidState(id));
        }
        c.pcb
            .and_then(|p| self.pcb_objs.slot(p))
            .and_then(|p| p.tcb)
            .ok_or(ChnlError::InvalidState(id))
    }

    fn require(&self, p: Protocol) -> Result<(), ChnlError> {
        if self.protosw().contains(p) {
            Ok(())
        } else {
            Err(ChnlError::NoProtocol(p.name()))
        }
    }

    /// Open a TCP listener on `local`. A wildcard address accepts for every
    /// local address on that port.
    pub fn chnl_listen(&mut self, local: SocketAddr) -> Result<ChnlId, ChnlError> {
        self.check_data_path()?;
        self.require(Protocol::Tcp)?;
        if self.tcp.listeners.contains_key(&local) {
            return Err(ChnlError::AddrInUse(local));
        }
        let conn = alloc_conn(self).ok_or(ChnlError::NoBufs)?;
        let now = self.tcp_now();
        let pcb = Pcb {
            proto: IPPROTO_TCP,
            local: Some(local),
            ..Pcb::default()
        };
        let chnl = Chnl {
            proto: IPPROTO_TCP,
            owned: true,
            listening: true,
            ..Chnl::default()
        };
        let tcb = Tcb {
            state: TcpState::Listen,
            listen_addr: Some(local),
            last_active: now,
            state_since: now,
            ..Tcb::default()
        };
        let (cid, tid) = install(self, conn, pcb, chnl, tcb);
        self.tcp.listeners.insert(local, tid);
        debug!(%local, chnl = %cid, "listening");
        Ok(ChnlId(cid))
    }

    /// Take the next established connection off a listener.
    pub fn chnl_accept(&mut self, listener: ChnlId) -> Result<Option<ChnlId>, ChnlError> {
        self.check_data_path()?;
        let c = self.chnl_mut(listener)?;
        if !c.listening {
            return Err(ChnlError::InvalidState(listener));
        }
        let Some(child) = c.accept_q.pop_front() else {
            return Ok(None);
        };
        if let Some(ch) = self.chnl_objs.slot_mut(child) {
            ch.owned = true;
            ch.parent = None;
        }
        Ok(Some(ChnlId(child)))
    }

    /// Active open. The SYN goes out with the next output pass.
    pub fn chnl_connect(
        &mut self,
        local: SocketAddr,
        remote: SocketAddr,
    ) -> Result<ChnlId, ChnlError> {
        self.check_data_path()?;
        self.require(Protocol::Tcp)?;
        let key = ConnKey { local, remote };
        if self.tcp.demux.contains_key(&key) {
            return Err(ChnlError::AddrInUse(local));
        }
        let conn = alloc_conn(self).ok_or(ChnlError::NoBufs)?;
        let now = self.tcp_now();
        let iss: u32 = rand::random();
        let pcb = Pcb {
            proto: IPPROTO_TCP,
            local: Some(local),
            remote: Some(remote),
            ..Pcb::default()
        };
        let chnl = Chnl {
            proto: IPPROTO_TCP,
            owned: true,
            ..Chnl::default()
        };
        let tcb = Tcb {
            state: TcpState::SynSent,
            key: Some(key),
            iss,
            snd_una: iss,
            snd_nxt: iss,
            last_active: now,
            state_since: now,
            ..Tcb::default()
        };
        let (cid, tid) = install(self, conn, pcb, chnl, tcb);
        if !queue_segment(self, tid, TcpFlags::SYN, Vec::new()) {
            if let Some(c) = self.chnl_objs.slot_mut(cid) {
                c.owned = false;
            }
            reap(self, tid);
            return Err(ChnlError::NoBufs);
        }
        schedule_output(self, tid);
        debug!(%local, %remote, chnl = %cid, "connecting");
        Ok(ChnlId(cid))
    }

    /// Bind a datagram channel to `local`.
    pub fn chnl_bind_udp(&mut self, local: SocketAddr) -> Result<ChnlId, ChnlError> {
        self.check_data_path()?;
        self.require(Protocol::Udp)?;
        udp::bind(self, local).map(ChnlId)
    }

    /// Queue stream data. Returns the number of bytes accepted, which is
    /// short when the send buffer or the segment pool runs out.
    pub fn chnl_send(&mut self, id: ChnlId, data: &[u8]) -> Result<usize, ChnlError> {
        self.check_data_path()?;
        let (nodelay, snd_hiwat) = {
            let c = self.chnl_ref(id)?;
            (c.nodelay, c.snd_hiwat)
        };
        let tid = self.chnl_tcb(id)?;
        let tcb = self.tcb_objs.slot(tid).ok_or(ChnlError::InvalidState(id))?;
        if !tcb.state.can_send() {
            return Err(ChnlError::InvalidState(id));
        }
        let in_flight = tcb.snd_una != tcb.snd_nxt;
        let queued: usize = tcb
            .sndq
            .iter()
            .filter_map(|h| self.seg_objs.get(h))
            .map(|s| s.payload.len())
            .sum();
        let take = data.len().min(snd_hiwat.saturating_sub(queued));
        let mss = self.tcp.mss;
        let mut accepted = 0;
        for chunk in data[..take].chunks(mss) {
            if !queue_segment(self, tid, TcpFlags::PSH, chunk.to_vec()) {
                break;
            }
            accepted += chunk.len();
        }
        // Small sends wait for outstanding data to be acknowledged unless
        // no-delay is set.
        if accepted > 0 && (nodelay || !in_flight) {
            schedule_output(self, tid);
        }
        Ok(accepted)
    }

    /// Read up to `max` bytes. Datagram channels return one datagram,
    /// truncated to `max`. An empty result with `eof` set in
    /// [`Stack::chnl_info`] means the peer is done.
    pub fn chnl_read(&mut self, id: ChnlId, max: usize) -> Result<Vec<u8>, ChnlError> {
        self.check_data_path()?;
        let c = self.chnl_mut(id)?;
        if c.listening {
            return Err(ChnlError::InvalidState(id));
        }
        let mut out = Vec::new();
        if c.proto == IPPROTO_UDP {
            if let Some(mut d) = c.rcv.pop_front() {
                c.rcv_cc -= d.len();
                d.truncate(max);
                out = d;
            }
            return Ok(out);
        }
        while out.len() < max {
            let Some(front) = c.rcv.front_mut() else {
                break;
            };
            let want = max - out.len();
            if front.len() <= want {
                out.extend_from_slice(front);
                c.rcv.pop_front();
            } else {
                out.extend(front.drain(..want));
            }
        }
        c.rcv_cc -= out.len();
        if !out.is_empty() {
            // Window opened.
            if let Ok(tid) = self.chnl_tcb(id) {
                if let Some(tcb) = self.tcb_objs.slot_mut(tid) {
                    tcb.ack_pending = true;
                }
                schedule_output(self, tid);
            }
        }
        Ok(out)
    }

    /// Release the channel. A TCP connection continues closing on its own
    /// with a FIN; a listener drops its unaccepted and half-open connections.
    pub fn chnl_close(&mut self, id: ChnlId) -> Result<(), ChnlError> {
        self.check_data_path()?;
        let (proto, pcb, listening, accept_q) = {
            let c = self.chnl_mut(id)?;
            (c.proto, c.pcb, c.listening, std::mem::take(&mut c.accept_q))
        };
        match proto {
            IPPROTO_TCP => {
                let tid = pcb.and_then(|p| self.pcb_objs.slot(p)).and_then(|p| p.tcb);
                if listening {
                    for child in accept_q {
                        let ctid = self
                            .chnl_objs
                            .slot(child)
                            .and_then(|c| c.pcb)
                            .and_then(|p| self.pcb_objs.slot(p))
                            .and_then(|p| p.tcb);
                        if let Some(ctid) = ctid {
                            tcp::reap(self, ctid);
                        }
                    }
                    if let Some(tid) = tid {
                        // Handshakes still in progress on this listener.
                        let embryonic: Vec<SlotId> = self
                            .tcbs
                            .keys()
                            .copied()
                            .filter(|&t| {
                                self.tcb_objs.slot(t).is_some_and(|c| {
                                    c.listener == Some(tid) && c.state == TcpState::SynRcvd
                                })
                            })
                            .collect();
                        for ctid in embryonic {
                            tcp::reap(self, ctid);
                        }
                        tcp::reap(self, tid);
                    }
                } else if let Some(tid) = tid {
                    self.detach_and_fin(tid);
                }
            }
            IPPROTO_UDP => {
                if let Some(p) = pcb {
                    udp::unbind(self, p);
                }
            }
            _ => {}
        }
        if let Some(h) = self.chnls.remove(&id.0) {
            give_back(&mut self.chnl_objs, h);
        }
        debug!(chnl = %id, "closed");
        Ok(())
    }

    fn detach_and_fin(&mut self, tid: SlotId) {
        let now = self.tcp_now();
        let Some(tcb) = self.tcb_objs.slot_mut(tid) else {
            return;
        };
        tcb.chnl = None;
        let pcb = tcb.pcb;
        let next = match tcb.state {
            TcpState::Established => Some(TcpState::FinWait1),
            TcpState::CloseWait => Some(TcpState::LastAck),
            TcpState::SynSent | TcpState::SynRcvd => {
                tcb.set_state(TcpState::Closed, now);
                None
            }
            _ => None,
        };
        if let Some(p) = pcb.and_then(|p| self.pcb_objs.slot_mut(p)) {
            p.chnl = None;
        }
        let Some(next) = next else {
            return;
        };
        let fin_queued = queue_segment(self, tid, TcpFlags::FIN, Vec::new());
        if let Some(tcb) = self.tcb_objs.slot_mut(tid) {
            // Without a segment for the FIN the connection is abandoned.
            tcb.set_state(if fin_queued { next } else { TcpState::Closed }, now);
        }
        if fin_queued {
            schedule_output(self, tid);
        }
    }

    pub fn chnl_set_opt(&mut self, id: ChnlId, opt: ChnlOpt) -> Result<(), ChnlError> {
        self.check_data_path()?;
        let name = opt.name();
        if !self.chnlopt.supports(name.level()) {
            return Err(ChnlError::UnsupportedOpt(name));
        }
        let c = self.chnl_mut(id)?;
        match opt {
            ChnlOpt::RcvBuf(0) | ChnlOpt::SndBuf(0) => return Err(ChnlError::InvalidOpt(name)),
            ChnlOpt::RcvBuf(n) => c.rcv_hiwat = n,
            ChnlOpt::SndBuf(n) => c.snd_hiwat = n,
            ChnlOpt::TcpNoDelay(on) => {
                if c.proto != IPPROTO_TCP {
                    return Err(ChnlError::UnsupportedOpt(name));
                }
                c.nodelay = on;
            }
        }
        Ok(())
    }

    pub fn chnl_get_opt(&self, id: ChnlId, name: OptName) -> Result<ChnlOpt, ChnlError> {
        self.check_data_path()?;
        if !self.chnlopt.supports(name.level()) {
            return Err(ChnlError::UnsupportedOpt(name));
        }
        let c = self.chnl_ref(id)?;
        Ok(match name {
            OptName::RcvBuf => ChnlOpt::RcvBuf(c.rcv_hiwat),
            OptName::SndBuf => ChnlOpt::SndBuf(c.snd_hiwat),
            OptName::TcpNoDelay if c.proto == IPPROTO_TCP => ChnlOpt::TcpNoDelay(c.nodelay),
            OptName::TcpNoDelay => return Err(ChnlError::UnsupportedOpt(name)),
        })
    }

    pub fn chnl_info(&self, id: ChnlId) -> Result<ChnlInfo, ChnlError> {
        let c = self.chnl_ref(id)?;
        let pcb = c.pcb.and_then(|p| self.pcb_objs.slot(p));
        let tcp_state = pcb
            .and_then(|p| p.tcb)
            .and_then(|t| self.tcb_objs.slot(t))
            .map(|t| t.state);
        Ok(ChnlInfo {
            proto: c.proto,
            listening: c.listening,
            readable: c.rcv_cc,
            pending_accepts: c.accept_q.len(),
            eof: c.eof,
            reset: c.reset,
            local: pcb.and_then(|p| p.local),
            remote: pcb.and_then(|p| p.remote),
            tcp_state,
        })
    }
}
