//! Load tracker config from file and environment.

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::session::SessionLimits;

/// Tracker configuration. File: `--config <path>`, else ~/.config/seed/tracker.toml or /etc/seed/tracker.toml.
/// Env overrides: SEED_TRACKER_BIND, SEED_TRACKER_IDENTITY_FILE, SEED_TRACKER_INIT_TIMEOUT_MS,
/// SEED_TRACKER_INIT_RETRIES, SEED_TRACKER_IDLE_CYCLE_MS, SEED_TRACKER_IDLE_CYCLES.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrackerConfig {
    /// Control channel listen address (default 0.0.0.0:5000).
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,
    /// Wait for each INIT attempt (default 10000 ms).
    #[serde(default = "default_init_timeout_ms")]
    pub init_timeout_ms: u64,
    /// Failed INIT attempts (malformed or timed out) before the connection is closed (default 10).
    #[serde(default = "default_init_retries")]
    pub init_retries: u32,
    /// One idle cycle on a registered connection (default 20000 ms).
    #[serde(default = "default_idle_cycle_ms")]
    pub idle_cycle_ms: u64,
    /// Silent cycles before a registered peer is presumed dead (default 10).
    #[serde(default = "default_idle_cycles")]
    pub idle_cycles: u32,
    /// How often finished session tasks are pruned (default 5000 ms).
    #[serde(default = "default_reap_interval_ms")]
    pub reap_interval_ms: u64,
    /// Where to write `tracker <addr>` at startup. Informational only.
    #[serde(default = "default_identity_file")]
    pub identity_file: Option<PathBuf>,
}

fn default_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 5000))
}
fn default_init_timeout_ms() -> u64 {
    10_000
}
fn default_init_retries() -> u32 {
    10
}
fn default_idle_cycle_ms() -> u64 {
    20_000
}
fn default_idle_cycles() -> u32 {
    10
}
fn default_reap_interval_ms() -> u64 {
    5_000
}
fn default_identity_file() -> Option<PathBuf> {
    Some(PathBuf::from("tracker.txt"))
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            init_timeout_ms: default_init_timeout_ms(),
            init_retries: default_init_retries(),
            idle_cycle_ms: default_idle_cycle_ms(),
            idle_cycles: default_idle_cycles(),
            reap_interval_ms: default_reap_interval_ms(),
            identity_file: default_identity_file(),
        }
    }
}

impl TrackerConfig {
    pub fn session_limits(&self) -> SessionLimits {
        SessionLimits {
            init_timeout: Duration::from_millis(self.init_timeout_ms),
            init_retries: self.init_retries,
            idle_cycle: Duration::from_millis(self.idle_cycle_ms),
            idle_cycles: self.idle_cycles,
        }
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reap_interval_ms.max(1))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parsing {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Load config: defaults, then the config file, then env vars.
/// An explicit path must exist and parse; the standard locations are optional.
pub fn load(explicit: Option<&Path>) -> Result<TrackerConfig, ConfigError> {
    let mut c = match explicit {
        Some(p) => read_file(p)?,
        None => match config_paths().into_iter().find(|p| p.exists()) {
            Some(p) => read_file(&p)?,
            None => TrackerConfig::default(),
        },
    };
    apply_env(&mut c);
    Ok(c)
}

fn read_file(path: &Path) -> Result<TrackerConfig, ConfigError> {
    let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&s).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn config_paths() -> Vec<PathBuf> {
    let mut out = Vec::new();
    if let Some(h) = std::env::var_os("HOME").map(PathBuf::from) {
        out.push(h.join(".config/seed/tracker.toml"));
    }
    out.push(PathBuf::from("/etc/seed/tracker.toml"));
    out
}

fn apply_env(c: &mut TrackerConfig) {
    env_override("SEED_TRACKER_BIND", &mut c.bind);
    env_override("SEED_TRACKER_INIT_TIMEOUT_MS", &mut c.init_timeout_ms);
    env_override("SEED_TRACKER_INIT_RETRIES", &mut c.init_retries);
    env_override("SEED_TRACKER_IDLE_CYCLE_MS", &mut c.idle_cycle_ms);
    env_override("SEED_TRACKER_IDLE_CYCLES", &mut c.idle_cycles);
    if let Some(p) = std::env::var_os("SEED_TRACKER_IDENTITY_FILE") {
        c.identity_file = (!p.is_empty()).then(|| PathBuf::from(p));
    }
}

fn env_override<T: FromStr>(key: &str, slot: &mut T) {
    if let Ok(s) = std::env::var(key) {
        match s.parse() {
            Ok(v) => *slot = v,
            Err(_) => log::warn!("ignoring invalid {}={}", key, s),
        }
    }
}
