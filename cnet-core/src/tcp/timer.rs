use tracing::debug;

use crate::pool::SlotId;
use crate::protosw::CtlReport;
use crate::stack::Stack;

use super::{reap, schedule_output, TcpState};

enum Sweep {
    Keep,
    Reap,
    Expire,
    Retransmit,
}

/// Retransmission timeout after `backoff` doublings, in slow ticks.
fn rto(base: u32, backoff: u8) -> u32 {
    base.saturating_mul(1u32 << backoff.min(16))
}

/// Slow-timeout sweep over every TCB: reap closed and finished TIME-WAIT
/// connections, expire idle ones, retransmit what went unacknowledged.
pub fn slow_timeout(stack: &mut Stack) -> CtlReport {
    let now = stack.tcp_now();
    let timers = stack.timers().clone();
    let mut report = CtlReport::default();
    let slots: Vec<SlotId> = stack.tcbs.keys().copied().collect();
    for slot in slots {
        let Some(tcb) = stack.tcb_objs.slot(slot) else {
            continue;
        };
        let oldest_unacked = tcb
            .sndq
            .front()
            .and_then(|h| stack.seg_objs.get(h))
            .filter(|seg| seg.sent)
            .map(|seg| seg.sent_at);
        let action = match tcb.state {
            TcpState::Listen => Sweep::Keep,
            TcpState::Closed => Sweep::Reap,
            TcpState::TimeWait => {
                if now.wrapping_sub(tcb.state_since) >= timers.msl.saturating_mul(2) {
                    Sweep::Reap
                } else {
                    Sweep::Keep
                }
            }
            _ if now.wrapping_sub(tcb.last_active) >= timers.idle_timeout => Sweep::Expire,
            _ => match oldest_unacked {
                Some(sent_at)
                    if now.wrapping_sub(sent_at) >= rto(timers.rexmt_base, tcb.backoff) =>
                {
                    if tcb.backoff >= timers.max_rexmt {
                        Sweep::Expire
                    } else {
                        Sweep::Retransmit
                    }
                }
                _ => Sweep::Keep,
            },
        };
        match action {
            Sweep::Keep => {}
            Sweep::Reap => {
                if reap(stack, slot) {
                    report.reaped += 1;
                }
            }
            Sweep::Expire => {
                let chnl = stack.tcb_objs.slot(slot).and_then(|t| t.chnl);
                if let Some(c) = chnl.and_then(|c| stack.chnl_objs.slot_mut(c)) {
                    c.reset = true;
                }
                if reap(stack, slot) {
                    debug!(tcb = %slot, "connection expired");
                    stack.stats().expired();
                    report.expired += 1;
                }
            }
            Sweep::Retransmit => {
                if let Some(tcb) = stack.tcb_objs.slot_mut(slot) {
                    tcb.backoff += 1;
                    // Go back N: everything after snd_una goes out again.
                    for h in tcb.sndq.iter() {
                        if let Some(seg) = stack.seg_objs.get_mut(h) {
                            seg.sent = false;
                        }
                    }
                }
                schedule_output(stack, slot);
                stack.stats().retransmitted();
                report.retransmitted += 1;
            }
        }
    }
    report
}
