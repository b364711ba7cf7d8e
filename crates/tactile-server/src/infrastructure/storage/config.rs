//! TOML-based configuration for the server binary.
//!
//! ```toml
//! server_name = "Tactile Server"
//! max_ping_time_ms = 1000
//! bind_address = "127.0.0.1"
//! port = 12345
//! log_level = "info"
//!
//! [[simulated_devices]]
//! name = "Test Vibrator"
//! identifier = "sim-0001"
//! vibrators = 2
//! battery = 0.8
//! ```
//!
//! Every field has a `#[serde(default = "...")]`, so an empty file (or no
//! file at all) yields a working configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// The config could not be serialized to TOML.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level server configuration stored on disk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    /// Name announced in the `ServerInfo` handshake reply.
    #[serde(default = "default_server_name")]
    pub server_name: String,
    /// Maximum interval between client pings in milliseconds; 0 disables.
    #[serde(default = "default_max_ping_time_ms")]
    pub max_ping_time_ms: u32,
    /// IP address the WebSocket listener binds to.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// TCP port of the WebSocket listener.
    #[serde(default = "default_port")]
    pub port: u16,
    /// `tracing` filter used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub simulated_devices: Vec<SimulatedDeviceEntry>,
}

/// One device reported by the simulated discovery back-end.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SimulatedDeviceEntry {
    pub name: String,
    pub identifier: String,
    #[serde(default)]
    pub vibrators: u32,
    #[serde(default)]
    pub rotators: u32,
    #[serde(default)]
    pub linear_actuators: u32,
    /// Battery level in `0.0..=1.0`; absent means no battery sensor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub battery: Option<f64>,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_server_name() -> String {
    "Tactile Server".to_string()
}
fn default_max_ping_time_ms() -> u32 {
    0
}
fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    12345
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_name: default_server_name(),
            max_ping_time_ms: default_max_ping_time_ms(),
            bind_address: default_bind_address(),
            port: default_port(),
            log_level: default_log_level(),
            simulated_devices: Vec::new(),
        }
    }
}

// ── Config repository ─────────────────────────────────────────────────────────

/// Loads `ServerConfig` from `path`, returning `ServerConfig::default()` if
/// the file does not exist.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// and [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_config(path: &Path) -> Result<ServerConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(toml::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ServerConfig::default()),
        Err(e) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

/// Persists `config` to `path`, creating parent directories as needed.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system failures or
/// [`ConfigError::Serialize`] if serialization fails.
pub fn save_config(path: &Path, config: &ServerConfig) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    }

    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("tactile-config-test-{}", std::process::id()))
            .join(name)
    }

    #[test]
    fn test_default_config_values() {
        // Arrange / Act
        let cfg = ServerConfig::default();

        // Assert
        assert_eq!(cfg.server_name, "Tactile Server");
        assert_eq!(cfg.max_ping_time_ms, 0);
        assert_eq!(cfg.port, 12345);
        assert_eq!(cfg.log_level, "info");
        assert!(cfg.simulated_devices.is_empty());
    }

    #[test]
    fn test_empty_toml_yields_defaults() {
        let cfg: ServerConfig = toml::from_str("").expect("deserialize");
        assert_eq!(cfg, ServerConfig::default());
    }

    #[test]
    fn test_partial_toml_keeps_other_defaults() {
        // Arrange
        let text = r#"
            max_ping_time_ms = 500

            [[simulated_devices]]
            name = "Wand"
            identifier = "wand-1"
            vibrators = 1
        "#;

        // Act
        let cfg: ServerConfig = toml::from_str(text).expect("deserialize");

        // Assert
        assert_eq!(cfg.max_ping_time_ms, 500);
        assert_eq!(cfg.port, 12345);
        assert_eq!(cfg.simulated_devices.len(), 1);
        assert_eq!(cfg.simulated_devices[0].vibrators, 1);
        assert_eq!(cfg.simulated_devices[0].rotators, 0);
        assert_eq!(cfg.simulated_devices[0].battery, None);
    }

    #[test]
    fn test_config_serializes_and_deserializes_round_trip() {
        let mut cfg = ServerConfig::default();
        cfg.port = 9000;
        cfg.simulated_devices.push(SimulatedDeviceEntry {
            name: "Twister".to_string(),
            identifier: "tw-1".to_string(),
            vibrators: 0,
            rotators: 1,
            linear_actuators: 0,
            battery: Some(0.5),
        });

        let toml_str = toml::to_string_pretty(&cfg).expect("serialize");
        let restored: ServerConfig = toml::from_str(&toml_str).expect("deserialize");

        assert_eq!(cfg, restored);
    }

    #[test]
    fn test_malformed_toml_is_parse_error() {
        let result: Result<ServerConfig, _> = toml::from_str("port = \"not a number\"");
        assert!(result.is_err());
    }

    #[test]
    fn test_load_missing_file_returns_default() {
        let path = temp_path("does-not-exist.toml");

        let cfg = load_config(&path).expect("missing file is not an error");

        assert_eq!(cfg, ServerConfig::default());
    }

    #[test]
    fn test_save_then_load_round_trips_through_disk() {
        // Arrange
        let path = temp_path("saved.toml");
        let mut cfg = ServerConfig::default();
        cfg.server_name = "Bench".to_string();

        // Act
        save_config(&path, &cfg).expect("save");
        let loaded = load_config(&path).expect("load");

        // Assert
        assert_eq!(loaded, cfg);
        let _ = std::fs::remove_file(&path);
    }
}
