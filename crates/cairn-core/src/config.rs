//! Configuration system for cairn.
//!
//! Resolution order: environment variables → config file → defaults.
//! Ports and the node id come from the command line and are not part of
//! the file — the file carries the knobs that rarely change per run.
//!
//! Config file location:
//!   1. $CAIRN_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/cairn/config.toml
//!   3. ~/.config/cairn/config.toml

use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CairnConfig {
    pub network: NetworkConfig,
    pub transfer: TransferConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Destination IP for announcement datagrams. The IPv4 limited
    /// broadcast address by default; tests aim it at loopback.
    pub broadcast_addr: Ipv4Addr,
    /// Seconds between announcement broadcasts.
    pub announce_interval_secs: u64,
    /// Seconds a peer may stay silent before the reaper evicts it.
    pub peer_ttl_secs: u64,
    /// Seconds between reaper sweeps.
    pub reap_interval_secs: u64,
    /// Listen backlog for the transfer server.
    pub accept_backlog: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Where completed and in-progress downloads land. Created at startup.
    pub download_dir: PathBuf,
    /// Connect/send/receive deadline for transfer sockets, milliseconds.
    pub socket_timeout_ms: u64,
    /// Download attempts per call before surfacing a partial result.
    pub max_retries: u32,
    /// Fault injection: half-close a serving connection after this many
    /// chunks. Only honored when the daemon is started with drops enabled.
    pub drop_frequency: u64,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            broadcast_addr: Ipv4Addr::BROADCAST,
            announce_interval_secs: 10,
            peer_ttl_secs: 60,
            reap_interval_secs: 10,
            accept_backlog: 10,
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("downloads"),
            socket_timeout_ms: 60_000,
            max_retries: 5,
            drop_frequency: 1000,
        }
    }
}

impl NetworkConfig {
    pub fn announce_interval(&self) -> Duration {
        Duration::from_secs(self.announce_interval_secs)
    }

    pub fn peer_ttl(&self) -> Duration {
        Duration::from_secs(self.peer_ttl_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }
}

impl TransferConfig {
    pub fn socket_timeout(&self) -> Duration {
        Duration::from_millis(self.socket_timeout_ms)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("cairn")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl CairnConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            CairnConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("CAIRN_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&CairnConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply CAIRN_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("CAIRN_NETWORK__BROADCAST_ADDR") {
            if let Ok(addr) = v.parse() {
                self.network.broadcast_addr = addr;
            }
        }
        if let Ok(v) = std::env::var("CAIRN_NETWORK__ANNOUNCE_INTERVAL_SECS") {
            if let Ok(secs) = v.parse() {
                self.network.announce_interval_secs = secs;
            }
        }
        if let Ok(v) = std::env::var("CAIRN_NETWORK__PEER_TTL_SECS") {
            if let Ok(secs) = v.parse() {
                self.network.peer_ttl_secs = secs;
            }
        }
        if let Ok(v) = std::env::var("CAIRN_NETWORK__REAP_INTERVAL_SECS") {
            if let Ok(secs) = v.parse() {
                self.network.reap_interval_secs = secs;
            }
        }
        if let Ok(v) = std::env::var("CAIRN_TRANSFER__DOWNLOAD_DIR") {
            self.transfer.download_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("CAIRN_TRANSFER__SOCKET_TIMEOUT_MS") {
            if let Ok(ms) = v.parse() {
                self.transfer.socket_timeout_ms = ms;
            }
        }
        if let Ok(v) = std::env::var("CAIRN_TRANSFER__MAX_RETRIES") {
            if let Ok(n) = v.parse() {
                self.transfer.max_retries = n;
            }
        }
        if let Ok(v) = std::env::var("CAIRN_TRANSFER__DROP_FREQUENCY") {
            if let Ok(n) = v.parse() {
                self.transfer.drop_frequency = n;
            }
        }
    }
}
