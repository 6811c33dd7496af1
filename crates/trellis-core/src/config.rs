//! Configuration system for Trellis.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $TRELLIS_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/trellis/config.toml
//!   3. ~/.config/trellis/config.toml

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use crate::identity::PeerId;
use crate::wire::{ChunkNumberWidth, PREFIX_LEN};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrellisConfig {
    pub identity: IdentityConfig,
    pub network: NetworkConfig,
    pub chunking: ChunkingConfig,
    pub super_peer: SuperPeerConfig,
    pub fallback: FallbackConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// This node's public key. Used for logging and to ignore our own traffic.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_key: Option<PeerId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address the primary UDP transport binds to.
    pub bind_host: IpAddr,
    /// UDP port for the primary transport. 0 = OS-assigned.
    pub bind_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    /// Width of the chunk number field in bytes (1, 2 or 3).
    pub chunk_number_width: u8,
    /// Largest datagram the primary transport will carry, header included.
    pub mtu: usize,
    /// Largest reassembled message. Bigger messages are refused both ways.
    pub max_content_length: usize,
    /// How long a partially received message may stay buffered.
    pub composed_message_transfer_timeout_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SuperPeerConfig {
    /// If true, this node acts as a super peer and runs the fallback server.
    pub enabled: bool,
    /// Public key of our own super peer, if we use one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_key: Option<PeerId>,
    /// Primary-transport addresses of our super peer.
    pub endpoints: Vec<SocketAddr>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackConfig {
    pub enabled: bool,
    /// Where the fallback client connects. Unset = first super peer
    /// endpoint's host on `client_connect_port`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_address: Option<SocketAddr>,
    pub client_connect_port: u16,
    /// Primary-transport silence from the super peer that triggers the fallback.
    pub client_timeout_ms: u64,
    pub server_bind_host: IpAddr,
    pub server_bind_port: u16,
    /// Fallback server connections with no traffic for this long are closed.
    pub server_idle_timeout_ms: u64,
    /// Answer non-conforming clients with a bare HTTP 200 before closing.
    pub status_enabled: bool,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            bind_port: 22527,
        }
    }
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_number_width: 2,
            mtu: 1400,
            max_content_length: 1_048_576, // 1 MiB
            composed_message_transfer_timeout_ms: 60_000,
        }
    }
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            client_address: None,
            client_connect_port: 443,
            client_timeout_ms: 60_000,
            server_bind_host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            server_bind_port: 443,
            server_idle_timeout_ms: 60_000,
            status_enabled: true,
        }
    }
}

impl ChunkingConfig {
    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.composed_message_transfer_timeout_ms)
    }
}

impl FallbackConfig {
    pub fn client_timeout(&self) -> Duration {
        Duration::from_millis(self.client_timeout_ms)
    }

    pub fn server_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.server_idle_timeout_ms)
    }

    pub fn server_bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.server_bind_host, self.server_bind_port)
    }

    /// Resolve the address the fallback client should connect to.
    pub fn client_target(&self, super_peer: &SuperPeerConfig) -> Option<SocketAddr> {
        self.client_address.or_else(|| {
            super_peer
                .endpoints
                .first()
                .map(|ep| SocketAddr::new(ep.ip(), self.client_connect_port))
        })
    }
}

impl NetworkConfig {
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_host, self.bind_port)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

pub fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("trellis")
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
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl TrellisConfig {
    /// Load config: env vars → file → defaults. The result is validated.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            TrellisConfig::default()
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("TRELLIS_CONFIG")
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
            let text = toml::to_string_pretty(&TrellisConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Reject settings the chunk codec or transports cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let width = ChunkNumberWidth::try_from(self.chunking.chunk_number_width)
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        let header_len = PREFIX_LEN + width.bytes();
        if self.chunking.mtu <= header_len {
            return Err(ConfigError::Invalid(format!(
                "mtu {} cannot hold a {header_len}-byte chunk header",
                self.chunking.mtu
            )));
        }
        if self.chunking.max_content_length == 0 {
            return Err(ConfigError::Invalid(
                "max_content_length must be positive".into(),
            ));
        }
        if self.fallback.enabled && self.fallback.client_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "fallback client_timeout_ms must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Apply TRELLIS_* overrides. `lookup` returns the value of a variable.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let flag = |v: String| v == "true" || v == "1";

        if let Some(p) = lookup("TRELLIS_NETWORK__BIND_PORT").and_then(|v| v.parse().ok()) {
            self.network.bind_port = p;
        }
        if let Some(w) = lookup("TRELLIS_CHUNKING__CHUNK_NUMBER_WIDTH").and_then(|v| v.parse().ok()) {
            self.chunking.chunk_number_width = w;
        }
        if let Some(n) = lookup("TRELLIS_CHUNKING__MAX_CONTENT_LENGTH").and_then(|v| v.parse().ok()) {
            self.chunking.max_content_length = n;
        }
        if let Some(v) = lookup("TRELLIS_SUPER_PEER__ENABLED") {
            self.super_peer.enabled = flag(v);
        }
        if let Some(v) = lookup("TRELLIS_FALLBACK__ENABLED") {
            self.fallback.enabled = flag(v);
        }
        if let Some(a) = lookup("TRELLIS_FALLBACK__CLIENT_ADDRESS").and_then(|v| v.parse().ok()) {
            self.fallback.client_address = Some(a);
        }
        if let Some(p) = lookup("TRELLIS_FALLBACK__SERVER_BIND_PORT").and_then(|v| v.parse().ok()) {
            self.fallback.server_bind_port = p;
        }
    }
}
