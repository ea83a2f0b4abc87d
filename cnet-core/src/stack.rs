//! Per-core stack instance.
//!
//! A [`Stack`] owns one full protocol state universe: pools, connection
//! collections, protocol switch table, timers. It is moved onto its core's
//! thread and only ever touched there. The parts other threads may look at
//! (identity, run state, counters, the control mutex) live in the shared
//! [`StackHandle`] that the registry also holds.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::thread::{self, ThreadId};

use bitflags::bitflags;
use tracing::{debug, info, trace, warn};

use crate::chnl::{Chnl, ChnlOptTable};
use crate::config::{CnetConfig, CoreConfig, PoolSizes, TimerConfig};
use crate::graph::{scatter, NodeOutput, Packet, PuntPolicy};
use crate::pcb::Pcb;
use crate::pool::{Handle, Pool, PoolError, SlotId};
use crate::protosw::{CtlReport, ProtoCtl, ProtoSwError, ProtoSwTable, Protocol};
use crate::registry::RegistryInner;
use crate::stats::{StackStats, StatsSnapshot};
use crate::tcp::{Segment, Tcb, TcpEntry, TcpSegment};
use crate::udp::UdpEntry;

/// Longest stack name, including the terminator the name field reserves.
pub const STACK_NAME_MAX: usize = 32;

bitflags! {
    /// Global behaviour flags, fixed at initialization.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct GlobalFlags: u32 {
        const TCP_TIMEOUT_ENABLED = 0x0000_0001;
        const RFC1323_TSTAMP_ENABLED = 0x0000_4000;
        const RFC1323_SCALE_ENABLED = 0x0000_8000;
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error("no cores configured")]
    NoCores,
    #[error("lcore {0} requested twice or already has a stack")]
    DuplicateCore(u16),
    #[error("stack name {0:?} requested twice or already registered")]
    DuplicateName(String),
    #[error("invalid stack name {0:?}")]
    BadName(String),
    #[error("stack index space exhausted")]
    TooMany,
    #[error("tick and slow timeout intervals must be non-zero")]
    BadTimer,
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    ProtoSw(#[from] ProtoSwError),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StopError {
    #[error("no stack instance {0:?}")]
    Unknown(String),
    #[error("stack instance {0:?} already stopped")]
    AlreadyStopped(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StackError {
    #[error("stack {0:?} is not bound to the calling thread")]
    NotBound(String),
    #[error("stack {0:?} is bound to another thread")]
    BoundElsewhere(String),
    #[error("thread already carries stack {0:?}")]
    ThreadTaken(String),
    #[error("stack {0:?} is not running")]
    NotRunning(String),
}

/// Stack instance name; at most `STACK_NAME_MAX - 1` bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StackName(String);

impl StackName {
    pub fn new(name: impl Into<String>) -> Result<Self, InitError> {
        let name = name.into();
        if name.is_empty() || name.len() >= STACK_NAME_MAX || name.contains('\0') {
            return Err(InitError::BadName(name));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StackName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RunState {
    /// Built but not yet registered.
    Created = 0,
    Running = 1,
    /// A control path asked the owner to stop at its next batch boundary.
    Stopping = 2,
    Stopped = 3,
}

impl RunState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => RunState::Running,
            2 => RunState::Stopping,
            3 => RunState::Stopped,
            _ => RunState::Created,
        }
    }
}

#[derive(Debug, Default)]
struct Control {
    tid: Option<ThreadId>,
    thread_name: Option<String>,
}

/// Shared, thread-safe view of a stack instance.
#[derive(Debug)]
pub struct StackHandle {
    idx: u16,
    lcore: u16,
    name: StackName,
    state: AtomicU8,
    ctrl: Mutex<Control>,
    stats: StackStats,
}

impl StackHandle {
    fn new(idx: u16, lcore: u16, name: StackName) -> Self {
        Self {
            idx,
            lcore,
            name,
            state: AtomicU8::new(RunState::Created as u8),
            ctrl: Mutex::new(Control::default()),
            stats: StackStats::default(),
        }
    }

    pub fn idx(&self) -> u16 {
        self.idx
    }

    pub fn lcore(&self) -> u16 {
        self.lcore
    }

    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    pub fn run_state(&self) -> RunState {
        RunState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_running(&self) -> bool {
        self.run_state() == RunState::Running
    }

    /// Thread the instance is bound to, if any.
    pub fn tid(&self) -> Option<ThreadId> {
        self.ctrl.lock().unwrap_or_else(PoisonError::into_inner).tid
    }

    pub fn thread_name(&self) -> Option<String> {
        self.ctrl
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .thread_name
            .clone()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub(crate) fn counters(&self) -> &StackStats {
        &self.stats
    }

    pub(crate) fn activate(&self) {
        self.state.store(RunState::Running as u8, Ordering::Release);
    }

    /// Running -> Stopping, exactly once.
    pub(crate) fn request_stop(&self) -> Result<(), StopError> {
        self.state
            .compare_exchange(
                RunState::Running as u8,
                RunState::Stopping as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| ())
            .map_err(|_| StopError::AlreadyStopped(self.name().to_string()))
    }

    /// Mark stopped; returns the previous state.
    fn finish(&self) -> RunState {
        RunState::from_u8(self.state.swap(RunState::Stopped as u8, Ordering::AcqRel))
    }
}

thread_local! {
    static THIS_STK: RefCell<Option<Arc<StackHandle>>> = const { RefCell::new(None) };
}

/// The stack bound to the calling thread.
pub fn this_stack() -> Option<Arc<StackHandle>> {
    THIS_STK.with(|s| s.borrow().clone())
}

/// Whether the calling thread's stack is running. False on unbound threads.
pub fn is_running() -> bool {
    THIS_STK.with(|s| s.borrow().as_ref().is_some_and(|h| h.is_running()))
}

/// Per-family counters for protocols whose bodies live outside this crate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProtoCounters {
    pub input: u64,
}

/// Object counts across the four pools.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolCounts {
    pub tcbs: usize,
    pub segments: usize,
    pub pcbs: usize,
    pub chnls: usize,
}

impl PoolCounts {
    pub fn total(&self) -> usize {
        self.tcbs + self.segments + self.pcbs + self.chnls
    }
}

/// Result of one batch through [`Stack::input`].
#[derive(Debug, Default)]
pub struct Dispatch {
    pub delivered: usize,
    pub dropped: usize,
    /// Packets for the fallback path.
    pub punted: Vec<Packet>,
    /// Segments produced by the output pass, if the batch requested one.
    pub output: Vec<TcpSegment>,
}

#[derive(Debug, Default)]
pub struct TickReport {
    pub ticks: u64,
    /// Whether this tick crossed a slow-timeout boundary.
    pub slow_timeout: bool,
    pub ctl: CtlReport,
    pub output: Vec<TcpSegment>,
}

#[derive(Debug)]
pub struct StopReport {
    pub name: String,
    pub lcore: u16,
    pub drained: CtlReport,
    pub chnls_released: usize,
    /// Objects that were still outstanding after every collection was
    /// drained and had to be reclaimed wholesale.
    pub leaked: PoolCounts,
    /// Free objects per pool once stopped; equal to `capacity`.
    pub available: PoolCounts,
    pub capacity: PoolCounts,
}

/// Return a handle to its pool, logging a refusal.
pub(crate) fn give_back<T: Default>(pool: &mut Pool<T>, handle: Handle<T>) {
    if let Err(rejected) = pool.release(handle) {
        warn!(pool = pool.name(), error = %rejected.reason, "release rejected");
    }
}

pub struct Stack {
    pub(crate) handle: Arc<StackHandle>,
    registry: Weak<Mutex<RegistryInner>>,
    bound: Option<ThreadId>,
    gflags: GlobalFlags,
    timers: TimerConfig,
    punt: PuntPolicy,
    ticks: u64,
    tcp_now: u32,
    pub(crate) tcb_objs: Pool<Tcb>,
    pub(crate) seg_objs: Pool<Segment>,
    pub(crate) pcb_objs: Pool<Pcb>,
    pub(crate) chnl_objs: Pool<Chnl>,
    pub(crate) chnls: HashMap<SlotId, Handle<Chnl>>,
    pub(crate) tcbs: HashMap<SlotId, Handle<Tcb>>,
    pub(crate) pcbs: HashMap<SlotId, Handle<Pcb>>,
    protosw: ProtoSwTable,
    pub(crate) chnlopt: ChnlOptTable,
    pub(crate) icmp: ProtoCounters,
    pub(crate) icmp6: ProtoCounters,
    pub(crate) ipv4: ProtoCounters,
    pub(crate) ipv6: ProtoCounters,
    pub(crate) raw: ProtoCounters,
    pub(crate) tcp: TcpEntry,
    pub(crate) udp: UdpEntry,
}

impl fmt::Debug for Stack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stack")
            .field("name", &self.name())
            .field("lcore", &self.lcore())
            .field("state", &self.handle.run_state())
            .field("ticks", &self.ticks)
            .finish()
    }
}

impl Stack {
    pub(crate) fn new(
        idx: u16,
        core: &CoreConfig,
        name: StackName,
        cfg: &CnetConfig,
        sizes: PoolSizes,
        registry: Weak<Mutex<RegistryInner>>,
    ) -> Result<Self, InitError> {
        let protosw = ProtoSwTable::new(&cfg.protocols)?;
        let punt = if protosw.contains(Protocol::Raw) {
            PuntPolicy::Punt
        } else {
            PuntPolicy::Drop
        };
        let chnlopt = ChnlOptTable::new(&protosw);
        let stack = Self {
            handle: Arc::new(StackHandle::new(idx, core.lcore, name)),
            registry,
            bound: None,
            gflags: cfg.global_flags(),
            timers: cfg.timers.clone(),
            punt,
            ticks: 0,
            tcp_now: 0,
            tcb_objs: Pool::with_capacity("tcb", sizes.tcbs)?,
            seg_objs: Pool::with_capacity("seg", sizes.segments)?,
            pcb_objs: Pool::with_capacity("pcb", sizes.pcbs)?,
            chnl_objs: Pool::with_capacity("chnl", sizes.chnls)?,
            chnls: HashMap::new(),
            tcbs: HashMap::new(),
            pcbs: HashMap::new(),
            protosw,
            chnlopt,
            icmp: ProtoCounters::default(),
            icmp6: ProtoCounters::default(),
            ipv4: ProtoCounters::default(),
            ipv6: ProtoCounters::default(),
            raw: ProtoCounters::default(),
            tcp: TcpEntry::default(),
            udp: UdpEntry::default(),
        };
        debug!(name = %stack.name(), lcore = core.lcore, ?sizes, "stack instance created");
        Ok(stack)
    }

    pub fn handle(&self) -> &Arc<StackHandle> {
        &self.handle
    }

    pub fn idx(&self) -> u16 {
        self.handle.idx()
    }

    pub fn lcore(&self) -> u16 {
        self.handle.lcore()
    }

    pub fn name(&self) -> &str {
        self.handle.name()
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_running()
    }

    pub fn gflags(&self) -> GlobalFlags {
        self.gflags
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Slow-timeout clock used by TCP timers.
    pub fn tcp_now(&self) -> u32 {
        self.tcp_now
    }

    pub fn punt_policy(&self) -> PuntPolicy {
        self.punt
    }

    pub fn protosw(&self) -> &ProtoSwTable {
        &self.protosw
    }

    pub(crate) fn timers(&self) -> &TimerConfig {
        &self.timers
    }

    pub(crate) fn stats(&self) -> &StackStats {
        self.handle.counters()
    }

    pub fn pools_in_use(&self) -> PoolCounts {
        PoolCounts {
            tcbs: self.tcb_objs.in_use(),
            segments: self.seg_objs.in_use(),
            pcbs: self.pcb_objs.in_use(),
            chnls: self.chnl_objs.in_use(),
        }
    }

    pub fn pools_available(&self) -> PoolCounts {
        PoolCounts {
            tcbs: self.tcb_objs.available(),
            segments: self.seg_objs.available(),
            pcbs: self.pcb_objs.available(),
            chnls: self.chnl_objs.available(),
        }
    }

    pub fn pools_capacity(&self) -> PoolCounts {
        PoolCounts {
            tcbs: self.tcb_objs.capacity(),
            segments: self.seg_objs.capacity(),
            pcbs: self.pcb_objs.capacity(),
            chnls: self.chnl_objs.capacity(),
        }
    }

    pub fn tcb_count(&self) -> usize {
        self.tcbs.len()
    }

    pub fn chnl_count(&self) -> usize {
        self.chnls.len()
    }

    /// Publish this instance as the calling thread's stack. A thread carries
    /// at most one stack for its whole lifetime, and a stack is bound to at
    /// most one thread.
    pub fn bind_current_thread(&mut self) -> Result<(), StackError> {
        let me = thread::current();
        if let Some(tid) = self.bound {
            if tid != me.id() {
                return Err(StackError::BoundElsewhere(self.name().to_string()));
            }
        }
        THIS_STK.with(|s| {
            let mut slot = s.borrow_mut();
            match slot.as_ref() {
                Some(cur) if Arc::ptr_eq(cur, &self.handle) => Ok(()),
                Some(cur) => Err(StackError::ThreadTaken(cur.name().to_string())),
                None => {
                    *slot = Some(Arc::clone(&self.handle));
                    Ok(())
                }
            }
        })?;
        self.bound = Some(me.id());
        let mut ctrl = self.handle.ctrl.lock().unwrap_or_else(PoisonError::into_inner);
        ctrl.tid = Some(me.id());
        ctrl.thread_name = me.name().map(str::to_string);
        debug!(name = %self.name(), thread = ?me.name(), "stack bound to thread");
        Ok(())
    }

    /// Every data-path entry point goes through here.
    pub(crate) fn check_data_path(&self) -> Result<(), StackError> {
        if !self.handle.is_running() {
            return Err(StackError::NotRunning(self.name().to_string()));
        }
        match self.bound {
            Some(tid) if tid == thread::current().id() => Ok(()),
            _ => Err(StackError::NotBound(self.name().to_string())),
        }
    }

    fn handlers(&self) -> Vec<Protocol> {
        self.protosw.entries().iter().map(|e| e.handler).collect()
    }

    /// Run one batch through the protocol input nodes, the channel receive
    /// node and, when any node asks for it, the protocol output routines.
    pub fn input(&mut self, pkts: Vec<Packet>) -> Result<Dispatch, StackError> {
        self.check_data_path()?;
        self.stats().rx(pkts.len());

        let mut groups: Vec<(u8, Vec<Packet>)> = Vec::new();
        for pkt in pkts {
            if pkt.src.is_ipv4() {
                self.ipv4.input += 1;
            } else {
                self.ipv6.input += 1;
            }
            match groups.iter_mut().find(|(p, _)| *p == pkt.proto) {
                Some((_, batch)) => batch.push(pkt),
                None => groups.push((pkt.proto, vec![pkt])),
            }
        }

        let mut dispatch = Dispatch::default();
        let mut run_output = false;
        for (proto, mut batch) in groups {
            let out = match self.protosw.lookup(proto).map(|e| e.handler) {
                Some(handler) => handler.handle_input(self, &mut batch),
                // Unsupported protocol.
                None => NodeOutput::uniform(batch.len(), self.punt.next()),
            };
            run_output |= out.check_output;
            let lanes = scatter(batch, &out);
            let (delivered, refused) = crate::chnl::chnl_recv(self, lanes.chnl_recv);
            dispatch.delivered += delivered;
            dispatch.dropped += lanes.drop.len() + refused;
            dispatch.punted.extend(lanes.punt);
        }
        self.stats().dropped(dispatch.dropped);
        self.stats().punted(dispatch.punted.len());
        self.stats().delivered(dispatch.delivered);
        if run_output {
            dispatch.output = self.run_output();
        }
        trace!(
            delivered = dispatch.delivered,
            dropped = dispatch.dropped,
            punted = dispatch.punted.len(),
            tx = dispatch.output.len(),
            "batch done"
        );
        Ok(dispatch)
    }

    /// Flush queued protocol output outside of a batch, e.g. after an
    /// application send or connect.
    pub fn output(&mut self) -> Result<Vec<TcpSegment>, StackError> {
        self.check_data_path()?;
        Ok(self.run_output())
    }

    fn run_output(&mut self) -> Vec<TcpSegment> {
        let mut out = Vec::new();
        for handler in self.handlers() {
            out.extend(handler.handle_output(self));
        }
        self.stats().transmitted(out.len());
        out
    }

    fn control(&mut self, ctl: ProtoCtl) -> CtlReport {
        let mut report = CtlReport::default();
        for handler in self.handlers() {
            report.merge(handler.handle_control(self, ctl));
        }
        report
    }

    /// Advance the tick counter. Every `slow_timeout_ticks` ticks the slow
    /// clock advances and, with timeouts enabled, every protocol runs its
    /// slow-timeout sweep.
    pub fn tick(&mut self) -> Result<TickReport, StackError> {
        self.check_data_path()?;
        self.ticks += 1;
        let mut report = TickReport {
            ticks: self.ticks,
            ..TickReport::default()
        };
        if self.ticks % self.timers.slow_timeout_ticks == 0 {
            self.tcp_now = self.tcp_now.wrapping_add(1);
            report.slow_timeout = true;
            if self.gflags.contains(GlobalFlags::TCP_TIMEOUT_ENABLED) {
                report.ctl = self.control(ProtoCtl::SlowTimeout);
                report.output = self.run_output();
            }
        }
        Ok(report)
    }

    /// Stop the instance: clear the run state, drain every protocol, release
    /// every channel, verify the pools are whole again and leave the registry.
    pub fn stop(mut self) -> Result<StopReport, StopError> {
        if self.handle.finish() == RunState::Stopped {
            return Err(StopError::AlreadyStopped(self.name().to_string()));
        }
        let drained = self.control(ProtoCtl::Drain);

        let mut chnls_released = 0;
        for (_, h) in self.chnls.drain() {
            give_back(&mut self.chnl_objs, h);
            chnls_released += 1;
        }
        for (_, h) in self.pcbs.drain() {
            give_back(&mut self.pcb_objs, h);
        }
        for (_, h) in self.tcbs.drain() {
            give_back(&mut self.tcb_objs, h);
        }

        let leaked = PoolCounts {
            tcbs: self.tcb_objs.reclaim_all(),
            segments: self.seg_objs.reclaim_all(),
            pcbs: self.pcb_objs.reclaim_all(),
            chnls: self.chnl_objs.reclaim_all(),
        };
        if leaked.total() > 0 {
            warn!(name = %self.name(), ?leaked, "reclaimed leaked pool objects");
        }

        let report = StopReport {
            name: self.name().to_string(),
            lcore: self.lcore(),
            drained,
            chnls_released,
            leaked,
            available: self.pools_available(),
            capacity: self.pools_capacity(),
        };
        debug_assert_eq!(report.available, report.capacity);
        let registered = self.unregister();
        info!(name = %report.name, lcore = report.lcore, reaped = drained.reaped, "stack stopped");
        if !registered {
            return Err(StopError::Unknown(report.name));
        }
        Ok(report)
    }

    fn unregister(&mut self) -> bool {
        match self.registry.upgrade() {
            Some(reg) => {
                let mut inner = reg.lock().unwrap_or_else(PoisonError::into_inner);
                inner.remove(&self.handle)
            }
            None => false,
        }
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        // Dropped without `stop` while live, e.g. a worker bailed out.
        match self.handle.finish() {
            RunState::Running | RunState::Stopping => {
                warn!(name = %self.name(), "stack dropped without stop");
                self.unregister();
            }
            RunState::Created | RunState::Stopped => {}
        }
    }
}
