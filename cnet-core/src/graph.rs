//! Graph node contract for protocol input nodes.
//!
//! The graph engine hands a node a batch of packets; the node classifies every
//! packet into a [`NextNode`] and separately reports whether the protocol's
//! output routine must run in the same scheduling slot. Classification never
//! fails as a whole: a bad packet only affects its own outcome.

use std::fmt;
use std::net::IpAddr;

use crate::pool::SlotId;
use crate::stack::Stack;

/// Packet descriptor handed over by the I/O framework after L3 processing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub src: IpAddr,
    pub dst: IpAddr,
    /// IP protocol number.
    pub proto: u8,
    /// Transport header and payload.
    pub l4: Vec<u8>,
    /// Written by input nodes for the nodes downstream.
    pub meta: PacketMeta,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketMeta {
    /// Channel the payload is delivered to.
    pub chnl: Option<SlotId>,
    /// Offset of the payload inside `l4`.
    pub payload_off: u16,
}

impl Packet {
    pub fn new(src: IpAddr, dst: IpAddr, proto: u8, l4: Vec<u8>) -> Self {
        Self {
            src,
            dst,
            proto,
            l4,
            meta: PacketMeta::default(),
        }
    }

    pub fn payload(&self) -> &[u8] {
        self.l4.get(self.meta.payload_off as usize..).unwrap_or(&[])
    }
}

/// Per-packet outcome of an input node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum NextNode {
    /// Discarded; counted as a drop.
    PktDrop = 0,
    /// Payload goes to the channel named in `meta.chnl`.
    ChnlRecv = 1,
    /// Not ours; forwarded to the fallback path.
    PktPunt = 2,
}

impl NextNode {
    pub const COUNT: usize = 3;
}

impl fmt::Display for NextNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NextNode::PktDrop => write!(f, "pkt-drop"),
            NextNode::ChnlRecv => write!(f, "chnl-recv"),
            NextNode::PktPunt => write!(f, "pkt-punt"),
        }
    }
}

/// Result of one node invocation: one outcome per input packet, in order,
/// plus the batch-level output request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeOutput {
    pub next: Vec<NextNode>,
    pub check_output: bool,
}

impl NodeOutput {
    pub fn with_capacity(n: usize) -> Self {
        Self {
            next: Vec::with_capacity(n),
            check_output: false,
        }
    }

    /// Every packet gets the same outcome.
    pub fn uniform(n: usize, next: NextNode) -> Self {
        Self {
            next: vec![next; n],
            check_output: false,
        }
    }

    pub fn count(&self, next: NextNode) -> usize {
        self.next.iter().filter(|&&n| n == next).count()
    }
}

/// Contract every protocol input node implements. Nodes are stateless; all
/// state lives in the stack instance passed in.
pub trait InputNode {
    const NAME: &'static str;

    /// Classify `pkts`. Must return exactly `pkts.len()` outcomes and may
    /// write `meta` on each packet.
    fn process(stack: &mut Stack, pkts: &mut [Packet]) -> NodeOutput;
}

/// How a well-formed packet that matches no local state is classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PuntPolicy {
    Drop,
    Punt,
}

impl PuntPolicy {
    pub fn next(self) -> NextNode {
        match self {
            PuntPolicy::Drop => NextNode::PktDrop,
            PuntPolicy::Punt => NextNode::PktPunt,
        }
    }
}

/// A batch split by outcome.
#[derive(Debug, Default)]
pub struct Lanes {
    pub drop: Vec<Packet>,
    pub chnl_recv: Vec<Packet>,
    pub punt: Vec<Packet>,
}

/// Move each packet to the lane its outcome names.
pub fn scatter(pkts: Vec<Packet>, out: &NodeOutput) -> Lanes {
    debug_assert_eq!(pkts.len(), out.next.len());
    let mut lanes = Lanes::default();
    for (pkt, next) in pkts.into_iter().zip(out.next.iter()) {
        match next {
            NextNode::PktDrop => lanes.drop.push(pkt),
            NextNode::ChnlRecv => lanes.chnl_recv.push(pkt),
            NextNode::PktPunt => lanes.punt.push(pkt),
        }
    }
    lanes
}
