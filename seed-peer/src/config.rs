//! Load peer config from file and environment.

use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use seed_core::ArqConfig;

use crate::tracker_client::ControlSettings;

/// Peer configuration. File: `--config <path>`, else ~/.config/seed/peer.toml or /etc/seed/peer.toml.
/// Env overrides: SEED_PEER_CLIENT_ID, SEED_PEER_FILE_BITMAP, SEED_PEER_SERVICE_PORT,
/// SEED_PEER_TRACKER, SEED_PEER_SHARE_DIR, SEED_PEER_DOWNLOAD_DIR.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PeerConfig {
    /// Identity announced to the tracker (default "peer").
    #[serde(default = "default_client_id")]
    pub client_id: String,
    /// Held files as `0`/`1` characters, one per file id (default "0").
    #[serde(default = "default_file_bitmap")]
    pub file_bitmap: String,
    /// Address the UDP service socket binds to (default 0.0.0.0).
    #[serde(default = "default_service_host")]
    pub service_host: IpAddr,
    /// UDP service port announced to the tracker (default 6000). 0 picks a free port.
    #[serde(default = "default_service_port")]
    pub service_port: u16,
    /// Tracker control channel (default 127.0.0.1:5000).
    #[serde(default = "default_tracker")]
    pub tracker: SocketAddr,
    /// Directory holding `<fileId>.txt` for every set bit (default ".").
    #[serde(default = "default_share_dir")]
    pub share_dir: PathBuf,
    /// Where downloads land (default `<share_dir>/downloads`).
    #[serde(default)]
    pub download_dir: Option<PathBuf>,
    /// Attempts to reach the tracker at startup (default 10).
    #[serde(default = "default_connect_retries")]
    pub connect_retries: u32,
    /// Pause between tracker connection attempts (default 1000 ms).
    #[serde(default = "default_connect_backoff_ms")]
    pub connect_backoff_ms: u64,
    /// Wait for each tracker reply (default 10000 ms).
    #[serde(default = "default_reply_timeout_ms")]
    pub reply_timeout_ms: u64,
    /// Reply timeouts tolerated per exchange before the tracker is presumed gone (default 10).
    #[serde(default = "default_reply_retries")]
    pub reply_retries: u32,
    /// Heartbeat period (default 10000 ms).
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_ms: u64,
    /// Transfer tunables.
    #[serde(default)]
    pub arq: ArqConfig,
}

fn default_client_id() -> String {
    "peer".to_string()
}
fn default_file_bitmap() -> String {
    "0".to_string()
}
fn default_service_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}
fn default_service_port() -> u16 {
    6000
}
fn default_tracker() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 5000))
}
fn default_share_dir() -> PathBuf {
    PathBuf::from(".")
}
fn default_connect_retries() -> u32 {
    10
}
fn default_connect_backoff_ms() -> u64 {
    1000
}
fn default_reply_timeout_ms() -> u64 {
    10_000
}
fn default_reply_retries() -> u32 {
    10
}
fn default_heartbeat_ms() -> u64 {
    10_000
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            client_id: default_client_id(),
            file_bitmap: default_file_bitmap(),
            service_host: default_service_host(),
            service_port: default_service_port(),
            tracker: default_tracker(),
            share_dir: default_share_dir(),
            download_dir: None,
            connect_retries: default_connect_retries(),
            connect_backoff_ms: default_connect_backoff_ms(),
            reply_timeout_ms: default_reply_timeout_ms(),
            reply_retries: default_reply_retries(),
            heartbeat_ms: default_heartbeat_ms(),
            arq: ArqConfig::default(),
        }
    }
}

impl PeerConfig {
    pub fn service_addr(&self) -> SocketAddr {
        SocketAddr::new(self.service_host, self.service_port)
    }

    pub fn download_dir(&self) -> PathBuf {
        self.download_dir
            .clone()
            .unwrap_or_else(|| self.share_dir.join("downloads"))
    }

    pub fn control_settings(&self) -> ControlSettings {
        ControlSettings {
            connect_retries: self.connect_retries.max(1),
            connect_backoff: Duration::from_millis(self.connect_backoff_ms),
            reply_timeout: Duration::from_millis(self.reply_timeout_ms),
            reply_retries: self.reply_retries,
            heartbeat: Duration::from_millis(self.heartbeat_ms.max(1)),
        }
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
/// A relative `share_dir` in an explicit file is resolved against the file's directory.
pub fn load(explicit: Option<&Path>) -> Result<PeerConfig, ConfigError> {
    let mut c = match explicit {
        Some(p) => {
            let mut c = read_file(p)?;
            if c.share_dir.is_relative() {
                if let Some(parent) = p.parent() {
                    c.share_dir = parent.join(&c.share_dir);
                }
            }
            c
        }
        None => match config_paths().into_iter().find(|p| p.exists()) {
            Some(p) => read_file(&p)?,
            None => PeerConfig::default(),
        },
    };
    apply_env(&mut c);
    Ok(c)
}

fn read_file(path: &Path) -> Result<PeerConfig, ConfigError> {
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
        out.push(h.join(".config/seed/peer.toml"));
    }
    out.push(PathBuf::from("/etc/seed/peer.toml"));
    out
}

fn apply_env(c: &mut PeerConfig) {
    env_override("SEED_PEER_CLIENT_ID", &mut c.client_id);
    env_override("SEED_PEER_FILE_BITMAP", &mut c.file_bitmap);
    env_override("SEED_PEER_SERVICE_PORT", &mut c.service_port);
    env_override("SEED_PEER_TRACKER", &mut c.tracker);
    if let Some(p) = std::env::var_os("SEED_PEER_SHARE_DIR") {
        c.share_dir = PathBuf::from(p);
    }
    if let Some(p) = std::env::var_os("SEED_PEER_DOWNLOAD_DIR") {
        c.download_dir = Some(PathBuf::from(p));
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_arq_table() {
        let c: PeerConfig = toml::from_str(
            "client_id = \"A\"\nfile_bitmap = \"0100\"\nservice_port = 9001\n\n[arq]\nsender_retries = 3\n",
        )
        .unwrap();
        assert_eq!(c.client_id, "A");
        assert_eq!(c.arq.sender_retries, 3);
        assert_eq!(c.arq.receiver_retries, 10);
        assert_eq!(c.tracker, default_tracker());
    }

    #[test]
    fn download_dir_defaults_under_share_dir() {
        let c = PeerConfig {
            share_dir: PathBuf::from("/srv/seed"),
            ..PeerConfig::default()
        };
        assert_eq!(c.download_dir(), PathBuf::from("/srv/seed/downloads"));
    }

    #[test]
    fn relative_share_dir_resolved_against_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peer.toml");
        std::fs::write(&path, "share_dir = \"files\"\n").unwrap();
        let c = load(Some(&path)).unwrap();
        assert_eq!(c.share_dir, dir.path().join("files"));
    }
}
