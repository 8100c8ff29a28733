//! Configuration system for gapmesh.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $GAPMESH_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/gapmesh/config.toml
//!   3. ~/.config/gapmesh/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GapmeshConfig {
    pub mesh: MeshConfig,
    pub internet: InternetConfig,
    pub limits: LimitsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Announce interval in seconds.
    pub announce_interval_secs: u64,
    /// Advertise/scan the pre-rotation constant service UUID too.
    pub legacy_uuid_compat: bool,
    /// Assumed writable payload per BLE write when the platform does not
    /// report a negotiated MTU.
    pub default_mtu: usize,
    /// Disconnect peers silent for this many seconds.
    pub inactivity_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InternetConfig {
    /// Relay websocket URLs, tried in order.
    pub relays: Vec<String>,
    /// Base reconnect backoff in milliseconds.
    pub reconnect_base_millis: u64,
    /// Backoff ceiling in milliseconds.
    pub reconnect_max_millis: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Seen-packet cache capacity.
    pub dedup_capacity: usize,
    /// Hard cap on a decoded payload, bytes.
    pub max_payload: usize,
    /// Per-peer outbox depth.
    pub outbox_depth: usize,
    /// Outbox entries older than this many hours are discarded.
    pub outbox_max_age_hours: u64,
    /// Partial-frame stall threshold for the stream assembler, ms.
    pub assembler_stall_millis: u64,
    /// Consecutive decode errors before a connection is dropped.
    pub decode_error_threshold: u32,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            announce_interval_secs: 60,
            legacy_uuid_compat: false,
            default_mtu: 185,
            inactivity_timeout_secs: 180,
        }
    }
}

impl Default for InternetConfig {
    fn default() -> Self {
        Self {
            relays: vec![
                "wss://relay.damus.io".to_string(),
                "wss://nos.lol".to_string(),
                "wss://relay.primal.net".to_string(),
                "wss://offchain.pub".to_string(),
                "wss://nostr21.com".to_string(),
            ],
            reconnect_base_millis: 1_000,
            reconnect_max_millis: 60_000,
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            dedup_capacity: 4096,
            max_payload: 64 * 1024,
            outbox_depth: 100,
            outbox_max_age_hours: 72,
            assembler_stall_millis: 1_500,
            decode_error_threshold: 10,
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("gapmesh")
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

impl GapmeshConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            GapmeshConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("GAPMESH_CONFIG")
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
            let text = toml::to_string_pretty(&GapmeshConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text)
                .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply GAPMESH_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("GAPMESH_MESH__ANNOUNCE_INTERVAL_SECS") {
            if let Ok(n) = v.parse() {
                self.mesh.announce_interval_secs = n;
            }
        }
        if let Ok(v) = std::env::var("GAPMESH_MESH__LEGACY_UUID_COMPAT") {
            self.mesh.legacy_uuid_compat = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("GAPMESH_MESH__DEFAULT_MTU") {
            if let Ok(n) = v.parse() {
                self.mesh.default_mtu = n;
            }
        }
        if let Ok(v) = std::env::var("GAPMESH_INTERNET__RELAYS") {
            let relays: Vec<String> = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            if !relays.is_empty() {
                self.internet.relays = relays;
            }
        }
        if let Ok(v) = std::env::var("GAPMESH_LIMITS__DEDUP_CAPACITY") {
            if let Ok(n) = v.parse() {
                self.limits.dedup_capacity = n;
            }
        }
        if let Ok(v) = std::env::var("GAPMESH_LIMITS__OUTBOX_DEPTH") {
            if let Ok(n) = v.parse() {
                self.limits.outbox_depth = n;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_relays() {
        let config = GapmeshConfig::default();
        assert_eq!(config.internet.relays.len(), 5);
        assert!(config.internet.relays[0].starts_with("wss://"));
        assert!(!config.mesh.legacy_uuid_compat);
    }

    #[test]
    fn defaults_round_trip_through_toml() {
        let config = GapmeshConfig::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: GapmeshConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.limits.dedup_capacity, config.limits.dedup_capacity);
        assert_eq!(parsed.internet.relays, config.internet.relays);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let parsed: GapmeshConfig =
            toml::from_str("[mesh]\nannounce_interval_secs = 15\n").unwrap();
        assert_eq!(parsed.mesh.announce_interval_secs, 15);
        assert_eq!(parsed.limits.max_payload, 64 * 1024);
        assert_eq!(parsed.internet.relays.len(), 5);
    }

    #[test]
    fn write_default_if_missing_creates_file() {
        let tmp = tempfile::tempdir().unwrap();
        let config_path = tmp.path().join("config.toml");

        std::env::set_var("GAPMESH_CONFIG", config_path.to_str().unwrap());
        let path = GapmeshConfig::write_default_if_missing().expect("write failed");
        assert!(path.exists());

        let config = GapmeshConfig::load().expect("load should succeed");
        assert_eq!(config.limits.outbox_depth, 100);
        std::env::remove_var("GAPMESH_CONFIG");
    }
}
