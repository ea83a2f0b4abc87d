//! Load daemon config from file and environment.

use std::path::{Path, PathBuf};

use cnet_core::{CnetConfig, CoreConfig};
use serde::Deserialize;
use tracing::{debug, warn};

/// Daemon configuration. File: ~/.config/cnet/cnet.toml or /etc/cnet/cnet.toml,
/// or whatever `--config` names.
/// Env overrides: CNET_CORES (comma-separated lcores), CNET_TICK_MS, CNET_STATS_SECS.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Seconds between per-instance stats lines; 0 disables them.
    #[serde(default = "default_stats_secs")]
    pub stats_secs: u64,
    #[serde(default)]
    pub stack: CnetConfig,
}

fn default_stats_secs() -> u64 {
    30
}

impl Default for Config {
    fn default() -> Self {
        Self {
            stats_secs: default_stats_secs(),
            stack: CnetConfig::default(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("{var}: bad value {value:?}")]
    Env { var: &'static str, value: String },
    #[error("{0} must be non-zero")]
    Zero(&'static str),
}

/// Load config: default, then config file, then env vars. An explicit path
/// must exist and parse; the default locations are skipped when absent.
pub fn load(explicit: Option<&Path>) -> Result<Config, ConfigError> {
    let mut c = match explicit {
        Some(p) => read(p)?,
        None => load_file()?.unwrap_or_default(),
    };
    apply_env(&mut c, |k| std::env::var(k).ok())?;
    check(&c)?;
    if c.stack.cores.is_empty() {
        debug!("no cores configured, using lcore 0");
        c.stack.cores.push(CoreConfig {
            lcore: 0,
            name: None,
        });
    }
    Ok(c)
}

fn apply_env(
    c: &mut Config,
    get: impl Fn(&'static str) -> Option<String>,
) -> Result<(), ConfigError> {
    if let Some(s) = get("CNET_CORES") {
        let lcores = s
            .split(',')
            .map(|t| t.trim().parse::<u16>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| ConfigError::Env {
                var: "CNET_CORES",
                value: s.clone(),
            })?;
        c.stack.cores = lcores
            .into_iter()
            .map(|lcore| CoreConfig { lcore, name: None })
            .collect();
    }
    if let Some(s) = get("CNET_TICK_MS") {
        c.stack.timers.tick_ms = s.parse().map_err(|_| ConfigError::Env {
            var: "CNET_TICK_MS",
            value: s.clone(),
        })?;
    }
    if let Some(s) = get("CNET_STATS_SECS") {
        c.stats_secs = s.parse().map_err(|_| ConfigError::Env {
            var: "CNET_STATS_SECS",
            value: s.clone(),
        })?;
    }
    Ok(())
}

/// Reject values the workers cannot run with.
fn check(c: &Config) -> Result<(), ConfigError> {
    if c.stack.timers.tick_ms == 0 {
        return Err(ConfigError::Zero("tick_ms"));
    }
    if c.stack.timers.slow_timeout_ticks == 0 {
        return Err(ConfigError::Zero("slow_timeout_ticks"));
    }
    Ok(())
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/cnet/cnet.toml"));
    }
    out.push(PathBuf::from("/etc/cnet/cnet.toml"));
    out
}

fn load_file() -> Result<Option<Config>, ConfigError> {
    for p in config_paths() {
        if p.exists() {
            return read(&p).map(Some);
        }
    }
    warn!("no config file found, using defaults");
    Ok(None)
}

fn read(path: &Path) -> Result<Config, ConfigError> {
    let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let c = parse(&s).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    debug!(path = %path.display(), "config loaded");
    Ok(c)
}

fn parse(s: &str) -> Result<Config, toml::de::Error> {
    toml::from_str(s)
}
