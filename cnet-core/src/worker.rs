//! Per-core run loop: bind, dispatch batches run-to-completion, tick on
//! cadence, stop when asked.

use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::{Duration, Instant};

use tracing::{info, info_span, warn};

use crate::graph::Packet;
use crate::stack::{Stack, StackError, StopError, StopReport};
use crate::tcp::TcpSegment;

/// Where a worker sends what the stack produces.
pub trait PacketSink {
    fn transmit(&mut self, segs: Vec<TcpSegment>);
    fn punt(&mut self, pkts: Vec<Packet>);
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Stack(#[from] StackError),
    #[error(transparent)]
    Stop(#[from] StopError),
}

/// Drive `stack` on the calling thread until its run state leaves Running or
/// the ingress channel closes, then stop it.
pub fn run_stack<S: PacketSink>(
    mut stack: Stack,
    ingress: Receiver<Vec<Packet>>,
    sink: &mut S,
    tick: Duration,
) -> Result<StopReport, WorkerError> {
    stack.bind_current_thread()?;
    let span = info_span!("stack", name = %stack.name(), lcore = stack.lcore());
    let _enter = span.enter();
    info!("worker started");

    let mut next_tick = Instant::now() + tick;
    while stack.is_running() {
        let wait = next_tick.saturating_duration_since(Instant::now());
        match ingress.recv_timeout(wait) {
            Ok(batch) => match stack.input(batch) {
                Ok(d) => {
                    if !d.output.is_empty() {
                        sink.transmit(d.output);
                    }
                    if !d.punted.is_empty() {
                        sink.punt(d.punted);
                    }
                }
                // Stop was requested while we were waiting.
                Err(StackError::NotRunning(_)) => break,
                Err(e) => return Err(e.into()),
            },
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                warn!("ingress closed");
                break;
            }
        }
        if Instant::now() >= next_tick {
            next_tick += tick;
            match stack.tick() {
                Ok(r) if !r.output.is_empty() => sink.transmit(r.output),
                Ok(_) => {}
                Err(StackError::NotRunning(_)) => break,
                Err(e) => return Err(e.into()),
            }
        }
    }
    Ok(stack.stop()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CnetConfig;
    use crate::registry::Registry;
    use std::sync::mpsc;

    #[derive(Default)]
    struct Collect {
        tx: Vec<TcpSegment>,
        punted: Vec<Packet>,
    }

    impl PacketSink for Collect {
        fn transmit(&mut self, segs: Vec<TcpSegment>) {
            self.tx.extend(segs);
        }
        fn punt(&mut self, pkts: Vec<Packet>) {
            self.punted.extend(pkts);
        }
    }

    #[test]
    fn control_stop_is_observed_by_worker() {
        let reg = Registry::new();
        let stacks = reg.initialize(&CnetConfig::with_cores(&[0, 1])).unwrap();
        let (senders, workers): (Vec<_>, Vec<_>) = stacks
            .into_iter()
            .map(|stack| {
                let (tx, rx) = mpsc::channel();
                let h = std::thread::spawn(move || {
                    let mut sink = Collect::default();
                    run_stack(stack, rx, &mut sink, Duration::from_millis(5))
                });
                (tx, h)
            })
            .unzip();

        for name in ["cnet-stk0", "cnet-stk1"] {
            reg.stop(name).unwrap();
        }
        for h in workers {
            let report = h.join().unwrap().unwrap();
            assert_eq!(report.leaked.total(), 0);
        }
        assert!(reg.is_empty());
        drop(senders);
    }

    #[test]
    fn closed_ingress_stops_the_stack() {
        let reg = Registry::new();
        let stack = reg
            .initialize(&CnetConfig::with_cores(&[3]))
            .unwrap()
            .pop()
            .unwrap();
        let (tx, rx) = mpsc::channel::<Vec<Packet>>();
        drop(tx);
        let mut sink = Collect::default();
        let report = run_stack(stack, rx, &mut sink, Duration::from_millis(1)).unwrap();
        assert_eq!(report.lcore, 3);
        assert!(reg.lookup_by_core(3).is_none());
    }

    #[test]
    fn punted_packets_reach_the_sink() {
        let reg = Registry::new();
        let stack = reg
            .initialize(&CnetConfig::with_cores(&[0]))
            .unwrap()
            .pop()
            .unwrap();
        let (tx, rx) = mpsc::channel();
        let a = "127.0.0.1".parse().unwrap();
        tx.send(vec![Packet::new(a, a, 1, vec![8, 0, 0, 0])]).unwrap();
        drop(tx);
        let mut sink = Collect::default();
        run_stack(stack, rx, &mut sink, Duration::from_secs(1)).unwrap();
        assert_eq!(sink.punted.len(), 1);
        assert!(sink.tx.is_empty());
    }
}
