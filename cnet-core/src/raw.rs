//! ICMP, ICMPv6 and raw input nodes. Their bodies are handled on the
//! fallback path, so these nodes only frame-check, count and punt.

use crate::graph::{InputNode, NextNode, NodeOutput, Packet};
use crate::protosw::IPPROTO_ICMPV6;
use crate::stack::Stack;

/// Type, code, checksum.
const ICMP_HDR_MIN: usize = 4;

pub struct IcmpInput;

impl InputNode for IcmpInput {
    const NAME: &'static str = "icmp-input";

    fn process(stack: &mut Stack, pkts: &mut [Packet]) -> NodeOutput {
        let mut out = NodeOutput::with_capacity(pkts.len());
        for pkt in pkts.iter() {
            if pkt.proto == IPPROTO_ICMPV6 {
                stack.icmp6.input += 1;
            } else {
                stack.icmp.input += 1;
            }
            if pkt.l4.len() < ICMP_HDR_MIN {
                stack.stats().malformed();
                out.next.push(NextNode::PktDrop);
            } else {
                out.next.push(NextNode::PktPunt);
            }
        }
        out
    }
}

pub struct RawInput;

impl InputNode for RawInput {
    const NAME: &'static str = "raw-input";

    fn process(stack: &mut Stack, pkts: &mut [Packet]) -> NodeOutput {
        stack.raw.input += pkts.len() as u64;
        NodeOutput::uniform(pkts.len(), NextNode::PktPunt)
    }
}
