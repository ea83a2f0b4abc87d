//! cnet core: per-core userspace TCP/IP stack instances.
//! Host-driven: the I/O framework hands in packet batches and ticks, and
//! takes back segments to transmit and packets to punt.

pub mod config;
pub mod graph;
pub mod pool;
pub mod protosw;
pub mod registry;
pub mod stack;
pub mod stats;

pub use config::{CnetConfig, CoreConfig, PoolSizes, ProtoName, TimerConfig};
pub use graph::{InputNode, NextNode, NodeOutput, Packet, PacketMeta, PuntPolicy};
pub use pool::{Handle, Pool, PoolError, SlotId};
pub use protosw::{ProtoSwTable, Protocol, PROTOSW_FREE_SLOT};
pub use registry::Registry;
pub use stack::{
    is_running, this_stack, Dispatch, GlobalFlags, InitError, RunState, Stack, StackError,
    StackHandle, StopError, StopReport, TickReport,
};
pub use stats::StatsSnapshot;

// Protocol bodies and the application boundary.
pub mod chnl;
pub mod pcb;
pub mod raw;
pub mod tcp;
pub mod udp;
pub mod worker;

pub use chnl::{ChnlError, ChnlId, ChnlInfo, ChnlOpt, OptName};
pub use tcp::{TcpSegment, TcpState};
pub use worker::{run_stack, PacketSink, WorkerError};
