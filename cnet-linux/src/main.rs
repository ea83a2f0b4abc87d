// cnet Linux: one stack worker thread per configured core, stopped on signal.

mod config;

use std::path::PathBuf;
use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::Context;
use cnet_core::{
    run_stack, Packet, PacketSink, Registry, Stack, StopReport, TcpSegment, WorkerError,
};
use tracing::{debug, error, info, warn};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// No NIC is attached here: transmitted segments and punted packets are
/// logged and dropped.
struct LogSink {
    lcore: u16,
    tx: u64,
    punted: u64,
}

impl PacketSink for LogSink {
    fn transmit(&mut self, segs: Vec<TcpSegment>) {
        self.tx += segs.len() as u64;
        for s in &segs {
            debug!(lcore = self.lcore, local = %s.local, remote = %s.remote, seq = s.seq, len = s.payload.len(), "tx");
        }
    }

    fn punt(&mut self, pkts: Vec<Packet>) {
        self.punted += pkts.len() as u64;
        debug!(lcore = self.lcore, count = pkts.len(), "punt");
    }
}

fn main() -> anyhow::Result<()> {
    let mut config_path: Option<PathBuf> = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("cnet-linux {}", VERSION);
                return Ok(());
            }
            "--config" | "-c" => {
                let p = args.next().context("--config needs a path")?;
                config_path = Some(PathBuf::from(p));
            }
            other => anyhow::bail!("unknown argument {other:?}"),
        }
    }

    tracing_subscriber::fmt::init();
    let cfg = config::load(config_path.as_deref())?;
    let tick = Duration::from_millis(cfg.stack.timers.tick_ms);

    let registry = Registry::global();
    let stacks = registry
        .initialize(&cfg.stack)
        .context("stack initialization failed")?;
    info!(instances = stacks.len(), "stacks initialized");

    let mut workers = Vec::with_capacity(stacks.len());
    let mut spawned = Ok(());
    for stack in stacks {
        match spawn_worker(stack, tick) {
            Ok(w) => workers.push(w),
            Err(e) => {
                // Stacks not yet handed to a thread unregister on drop.
                spawned = Err(e);
                break;
            }
        }
    }

    // Workers are stopped and joined whatever happens to the runtime.
    let waited = spawned.and_then(|()| wait_for_shutdown(cfg.stats_secs));
    if let Err(e) = &waited {
        error!(error = %e, "shutting down early");
    }

    info!("shutting down");
    let clean = stop_workers(registry, workers);
    waited?;
    if !clean {
        anyhow::bail!("one or more stack workers failed");
    }
    Ok(())
}

type WorkerResult = (Result<StopReport, WorkerError>, u64, u64);

struct Worker {
    name: String,
    ingress: mpsc::Sender<Vec<Packet>>,
    thread: JoinHandle<WorkerResult>,
}

/// Move `stack` onto its own named thread.
fn spawn_worker(stack: Stack, tick: Duration) -> anyhow::Result<Worker> {
    let name = stack.name().to_string();
    let lcore = stack.lcore();
    let (tx, rx) = mpsc::channel::<Vec<Packet>>();
    let thread = std::thread::Builder::new()
        .name(name.clone())
        .spawn(move || {
            let mut sink = LogSink {
                lcore,
                tx: 0,
                punted: 0,
            };
            let r = run_stack(stack, rx, &mut sink, tick);
            (r, sink.tx, sink.punted)
        })
        .with_context(|| format!("spawn worker {name}"))?;
    Ok(Worker {
        name,
        ingress: tx,
        thread,
    })
}

/// Ask every instance to stop, close the ingress channels and join. Returns
/// false if any worker failed.
fn stop_workers(registry: &Registry, workers: Vec<Worker>) -> bool {
    for h in registry.stop_all() {
        debug!(name = h.name(), "stop requested");
    }
    let mut clean = true;
    for Worker {
        name,
        ingress,
        thread,
    } in workers
    {
        drop(ingress);
        match thread.join() {
            Ok((Ok(report), tx, punted)) => {
                if report.leaked.total() > 0 {
                    warn!(name = %name, leaked = ?report.leaked, "objects reclaimed at stop");
                }
                info!(
                    name = %name,
                    lcore = report.lcore,
                    reaped = report.drained.reaped,
                    chnls = report.chnls_released,
                    tx,
                    punted,
                    "stack stopped"
                );
            }
            Ok((Err(e), _, _)) => {
                error!(name = %name, error = %e, "worker failed");
                clean = false;
            }
            Err(_) => {
                error!(name = %name, "worker panicked");
                clean = false;
            }
        }
    }
    clean
}

/// Run the stats reporter until Ctrl+C or SIGTERM.
fn wait_for_shutdown(stats_secs: u64) -> anyhow::Result<()> {
    let rt = tokio::runtime::Runtime::new().context("tokio runtime")?;
    rt.block_on(async {
        let reporter = (stats_secs > 0)
            .then(|| tokio::spawn(report_stats(Duration::from_secs(stats_secs))));
        let r = shutdown_signal().await;
        if let Some(t) = reporter {
            t.abort();
        }
        r
    })
}

/// Log each running instance's counters on `every`.
async fn report_stats(every: Duration) {
    let mut interval = tokio::time::interval(every);
    interval.tick().await;
    loop {
        interval.tick().await;
        for h in Registry::global().handles() {
            let s = h.stats();
            info!(
                name = h.name(),
                state = ?h.run_state(),
                rx = s.rx_packets,
                drops = s.drops,
                punts = s.punts,
                delivered = s.deliveries,
                tx = s.tx_segments,
                "stats"
            );
        }
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cnet_core::CnetConfig;

    #[test]
    fn stop_workers_stops_running_stacks() {
        let reg = Registry::new();
        let stacks = reg.initialize(&CnetConfig::with_cores(&[0, 1])).unwrap();
        let workers: Vec<Worker> = stacks
            .into_iter()
            .map(|s| spawn_worker(s, Duration::from_millis(5)).unwrap())
            .collect();
        assert_eq!(reg.len(), 2);
        assert!(stop_workers(&reg, workers));
        assert!(reg.is_empty());
    }

    #[test]
    fn stop_workers_without_workers_is_clean() {
        let reg = Registry::new();
        assert!(stop_workers(&reg, Vec::new()));
    }
}
