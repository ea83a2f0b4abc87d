//! Stack configuration, consumed once by `Registry::initialize`.
//!
//! The daemon reads this from TOML; tests build it directly.

use serde::Deserialize;

use crate::stack::GlobalFlags;

/// Descriptor ring defaults per port.
pub const DEFAULT_RX_DESC: u32 = 128;
pub const DEFAULT_TX_DESC: u32 = 256;

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CnetConfig {
    /// Participating cores, one stack instance each.
    #[serde(default, rename = "core")]
    pub cores: Vec<CoreConfig>,
    #[serde(default)]
    pub sizing: Sizing,
    #[serde(default)]
    pub pools: PoolOverrides,
    #[serde(default)]
    pub flags: FlagsConfig,
    #[serde(default)]
    pub timers: TimerConfig,
    /// Protocols bound in every instance's protocol switch table.
    #[serde(default = "default_protocols")]
    pub protocols: Vec<ProtoName>,
}

impl Default for CnetConfig {
    fn default() -> Self {
        Self {
            cores: Vec::new(),
            sizing: Sizing::default(),
            pools: PoolOverrides::default(),
            flags: FlagsConfig::default(),
            timers: TimerConfig::default(),
            protocols: default_protocols(),
        }
    }
}

impl CnetConfig {
    /// Configuration for the given lcores with everything else defaulted.
    pub fn with_cores(lcores: &[u16]) -> Self {
        Self {
            cores: lcores
                .iter()
                .map(|&lcore| CoreConfig { lcore, name: None })
                .collect(),
            ..Self::default()
        }
    }

    pub fn pool_sizes(&self) -> PoolSizes {
        PoolSizes::derive(&self.sizing, &self.pools)
    }

    pub fn global_flags(&self) -> GlobalFlags {
        let mut flags = GlobalFlags::empty();
        flags.set(GlobalFlags::TCP_TIMEOUT_ENABLED, self.flags.tcp_timeout);
        flags.set(GlobalFlags::RFC1323_TSTAMP_ENABLED, self.flags.rfc1323_tstamp);
        flags.set(GlobalFlags::RFC1323_SCALE_ENABLED, self.flags.rfc1323_scale);
        flags
    }
}

/// One participating core.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CoreConfig {
    pub lcore: u16,
    /// Instance name; defaults to `cnet-stk<lcore>`.
    #[serde(default)]
    pub name: Option<String>,
}

impl CoreConfig {
    pub fn instance_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("cnet-stk{}", self.lcore))
    }
}

/// Per-port and per-queue sizing that pool capacities are derived from.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Sizing {
    #[serde(default = "default_ports")]
    pub ports: u32,
    #[serde(default = "default_rx_desc")]
    pub rx_desc: u32,
    #[serde(default = "default_tx_desc")]
    pub tx_desc: u32,
}

fn default_ports() -> u32 {
    1
}
fn default_rx_desc() -> u32 {
    DEFAULT_RX_DESC
}
fn default_tx_desc() -> u32 {
    DEFAULT_TX_DESC
}

impl Default for Sizing {
    fn default() -> Self {
        Self {
            ports: default_ports(),
            rx_desc: default_rx_desc(),
            tx_desc: default_tx_desc(),
        }
    }
}

/// Explicit capacities, each overriding the derived value.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PoolOverrides {
    pub tcbs: Option<u32>,
    pub segments: Option<u32>,
    pub pcbs: Option<u32>,
    pub chnls: Option<u32>,
}

/// Final capacities of the four per-instance pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSizes {
    pub tcbs: usize,
    pub segments: usize,
    pub pcbs: usize,
    pub chnls: usize,
}

impl PoolSizes {
    /// Segments: one per rx and tx descriptor across all ports.
    /// Connections (TCB, PCB, channel): one per rx descriptor.
    pub fn derive(sizing: &Sizing, overrides: &PoolOverrides) -> Self {
        let ports = sizing.ports as usize;
        let conns = ports.saturating_mul(sizing.rx_desc as usize);
        let segs = ports.saturating_mul((sizing.rx_desc as usize).saturating_add(sizing.tx_desc as usize));
        let pick = |o: Option<u32>, d: usize| o.map(|v| v as usize).unwrap_or(d);
        Self {
            tcbs: pick(overrides.tcbs, conns),
            segments: pick(overrides.segments, segs),
            pcbs: pick(overrides.pcbs, conns),
            chnls: pick(overrides.chnls, conns),
        }
    }
}

/// Global behaviour flags, fixed at initialization.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FlagsConfig {
    #[serde(default = "default_true")]
    pub tcp_timeout: bool,
    #[serde(default)]
    pub rfc1323_tstamp: bool,
    #[serde(default)]
    pub rfc1323_scale: bool,
}

fn default_true() -> bool {
    true
}

impl Default for FlagsConfig {
    fn default() -> Self {
        Self {
            tcp_timeout: true,
            rfc1323_tstamp: false,
            rfc1323_scale: false,
        }
    }
}

/// Timer cadence. `tick_ms` is the worker's tick period; the remaining
/// values are counted in slow-timeout units (`tcp_now` increments).
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimerConfig {
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    /// Ticks per slow timeout.
    #[serde(default = "default_slow_timeout_ticks")]
    pub slow_timeout_ticks: u64,
    /// Idle connection lifetime.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u32,
    /// Initial retransmission timeout.
    #[serde(default = "default_rexmt_base")]
    pub rexmt_base: u32,
    /// Retransmission backoffs before the connection is dropped.
    #[serde(default = "default_max_rexmt")]
    pub max_rexmt: u8,
    /// Maximum segment lifetime; TIME-WAIT lasts twice this.
    #[serde(default = "default_msl")]
    pub msl: u32,
}

fn default_tick_ms() -> u64 {
    100
}
fn default_slow_timeout_ticks() -> u64 {
    5
}
fn default_idle_timeout() -> u32 {
    // two hours of 500ms slow ticks
    14_400
}
fn default_rexmt_base() -> u32 {
    2
}
fn default_max_rexmt() -> u8 {
    12
}
fn default_msl() -> u32 {
    60
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
            slow_timeout_ticks: default_slow_timeout_ticks(),
            idle_timeout: default_idle_timeout(),
            rexmt_base: default_rexmt_base(),
            max_rexmt: default_max_rexmt(),
            msl: default_msl(),
        }
    }
}

/// Protocol names accepted in `protocols`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtoName {
    Tcp,
    Udp,
    Icmp,
    Icmp6,
    Raw,
}

fn default_protocols() -> Vec<ProtoName> {
    vec![ProtoName::Tcp, ProtoName::Udp, ProtoName::Icmp, ProtoName::Icmp6]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_derive_capacities_from_sizing() {
        let cfg = CnetConfig::with_cores(&[0]);
        let sizes = cfg.pool_sizes();
        assert_eq!(sizes.tcbs, 128);
        assert_eq!(sizes.segments, 384);
        assert_eq!(sizes.pcbs, 128);
        assert_eq!(sizes.chnls, 128);
        assert!(cfg.global_flags().contains(GlobalFlags::TCP_TIMEOUT_ENABLED));
        assert!(!cfg.global_flags().contains(GlobalFlags::RFC1323_SCALE_ENABLED));
    }

    #[test]
    fn parse_toml() {
        let text = r#"
            protocols = ["tcp", "raw"]

            [[core]]
            lcore = 2
            name = "edge"

            [[core]]
            lcore = 3

            [sizing]
            ports = 2
            rx_desc = 64

            [pools]
            segments = 1000

            [flags]
            rfc1323_scale = true

            [timers]
            idle_timeout = 10
        "#;
        let cfg: CnetConfig = toml::from_str(text).unwrap();
        assert_eq!(cfg.cores.len(), 2);
        assert_eq!(cfg.cores[0].instance_name(), "edge");
        assert_eq!(cfg.cores[1].instance_name(), "cnet-stk3");
        assert_eq!(cfg.protocols, vec![ProtoName::Tcp, ProtoName::Raw]);
        let sizes = cfg.pool_sizes();
        assert_eq!(sizes.tcbs, 128);
        assert_eq!(sizes.segments, 1000);
        assert!(cfg.global_flags().contains(GlobalFlags::RFC1323_SCALE_ENABLED));
        assert_eq!(cfg.timers.idle_timeout, 10);
        assert_eq!(cfg.timers.slow_timeout_ticks, 5);
    }

    #[test]
    fn unknown_fields_rejected() {
        let text = "[sizing]\nqueues = 4\n";
        assert!(toml::from_str::<CnetConfig>(text).is_err());
    }
}
