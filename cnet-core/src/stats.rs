//! Per-instance counters. The owning thread writes them; control paths read
//! snapshots without taking any lock.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct StackStats {
    rx_packets: AtomicU64,
    drops: AtomicU64,
    malformed: AtomicU64,
    punts: AtomicU64,
    deliveries: AtomicU64,
    pool_exhausted: AtomicU64,
    tx_segments: AtomicU64,
    retransmits: AtomicU64,
    expired: AtomicU64,
}

/// Point-in-time copy of [`StackStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub rx_packets: u64,
    pub drops: u64,
    pub malformed: u64,
    pub punts: u64,
    pub deliveries: u64,
    pub pool_exhausted: u64,
    pub tx_segments: u64,
    pub retransmits: u64,
    pub expired: u64,
}

#[inline]
fn bump(c: &AtomicU64, n: u64) {
    c.fetch_add(n, Ordering::Relaxed);
}

impl StackStats {
    pub fn rx(&self, n: usize) {
        bump(&self.rx_packets, n as u64);
    }
    pub fn dropped(&self, n: usize) {
        bump(&self.drops, n as u64);
    }
    pub fn malformed(&self) {
        bump(&self.malformed, 1);
    }
    pub fn punted(&self, n: usize) {
        bump(&self.punts, n as u64);
    }
    pub fn delivered(&self, n: usize) {
        bump(&self.deliveries, n as u64);
    }
    pub fn pool_exhausted(&self) {
        bump(&self.pool_exhausted, 1);
    }
    pub fn transmitted(&self, n: usize) {
        bump(&self.tx_segments, n as u64);
    }
    pub fn retransmitted(&self) {
        bump(&self.retransmits, 1);
    }
    pub fn expired(&self) {
        bump(&self.expired, 1);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let r = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            rx_packets: r(&self.rx_packets),
            drops: r(&self.drops),
            malformed: r(&self.malformed),
            punts: r(&self.punts),
            deliveries: r(&self.deliveries),
            pool_exhausted: r(&self.pool_exhausted),
            tx_segments: r(&self.tx_segments),
            retransmits: r(&self.retransmits),
            expired: r(&self.expired),
        }
    }
}
