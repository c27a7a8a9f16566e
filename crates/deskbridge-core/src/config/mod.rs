//! Configuration management for DeskBridge.
//!
//! This module handles loading, saving, and managing DeskBridge configuration.
//!
//! ## Configuration File Locations
//!
//! | Platform | Path |
//! |----------|------|
//! | Linux | `~/.config/deskbridge/config.toml` |
//! | macOS | `~/Library/Application Support/com.deskbridge.DeskBridge/config.toml` |
//! | Windows | `%APPDATA%\deskbridge\DeskBridge\config\config.toml` |
//!
//! ## Example
//!
//! ```rust,ignore
//! use deskbridge_core::config::Config;
//!
//! let config = Config::load()?;
//! println!("Broker: {}", config.broker.host);
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Main configuration struct for DeskBridge.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,
    /// Signaling broker settings
    pub broker: BrokerConfig,
    /// Security settings
    pub security: SecurityConfig,
    /// Session lifecycle settings
    pub session: SessionConfig,
    /// File transfer settings
    pub transfer: TransferConfig,
    /// Liveness probe settings
    pub status: StatusConfig,
}

/// General configuration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Display name of this device
    pub device_name: String,
    /// Where received files are placed (None = platform download dir)
    pub download_dir: Option<PathBuf>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            device_name: hostname::get().map_or_else(
                |_| "DeskBridge Device".to_string(),
                |h| h.to_string_lossy().to_string(),
            ),
            download_dir: None,
        }
    }
}

/// Signaling broker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Broker host, or `cloud` for the public broker
    pub host: String,
    /// Broker port
    pub port: u16,
    /// Broker mount path
    pub path: String,
    /// STUN/TURN servers handed to the transport
    pub ice_servers: Vec<String>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: CLOUD_BROKER.to_string(),
            port: crate::DEFAULT_BROKER_PORT,
            path: crate::DEFAULT_BROKER_PATH.to_string(),
            ice_servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
            ],
        }
    }
}

/// Host value selecting the public broker.
pub const CLOUD_BROKER: &str = "cloud";

impl BrokerConfig {
    /// Whether the public broker is in use.
    #[must_use]
    pub fn is_cloud(&self) -> bool {
        self.host.eq_ignore_ascii_case(CLOUD_BROKER)
    }

    /// Candidate peer-list URLs for bulk liveness queries, most specific first.
    ///
    /// The public broker does not expose a peer list, so this is empty there.
    #[must_use]
    pub fn peer_list_urls(&self) -> Vec<String> {
        if self.is_cloud() {
            return Vec::new();
        }

        let base = format!("http://{}:{}", self.host, self.port);
        let path = self.path.trim_end_matches('/');
        let mut urls = Vec::with_capacity(3);
        if !path.is_empty() {
            urls.push(format!("{base}{path}{path}/peers"));
            urls.push(format!("{base}{path}/peers"));
        }
        urls.push(format!("{base}/peers"));
        urls
    }
}

/// Security configuration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Persistent secret accepted without a human present
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unattended_secret: Option<String>,
    /// Digits in a generated session secret
    pub session_secret_length: usize,
    /// Authenticate incoming sessions when no secret is configured at all
    pub allow_passwordless: bool,
    /// Failed attempts before lockout
    pub max_auth_attempts: u32,
    /// Lockout duration
    #[serde(with = "humantime_serde")]
    pub auth_lockout: Duration,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            unattended_secret: None,
            session_secret_length: 6,
            allow_passwordless: true,
            max_auth_attempts: 5,
            auth_lockout: Duration::from_secs(30),
        }
    }
}

/// Session lifecycle configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Window for either channel to open on an outbound attempt
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Interval between client heartbeats
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,
    /// Silence after which a client session is flagged reconnecting
    #[serde(with = "humantime_serde")]
    pub heartbeat_timeout: Duration,
    /// Size of the recent-identifiers list
    pub recent_limit: usize,
    /// How long a validated handover token keeps validating
    #[serde(with = "humantime_serde")]
    pub handover_grace: Duration,
    /// Push local clipboard changes to authenticated sessions
    pub clipboard_sync: bool,
    /// Clipboard polling interval while syncing
    #[serde(with = "humantime_serde")]
    pub clipboard_poll_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(crate::DEFAULT_CONNECT_TIMEOUT_SECS),
            heartbeat_interval: Duration::from_secs(3),
            heartbeat_timeout: Duration::from_secs(10),
            recent_limit: crate::DEFAULT_RECENT_LIMIT,
            handover_grace: Duration::from_secs(2),
            clipboard_sync: true,
            clipboard_poll_interval: Duration::from_millis(1500),
        }
    }
}

/// File transfer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Chunk size for outbound transfers
    pub chunk_size: usize,
    /// Chunks sent before yielding to the event loop
    pub yield_every: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: crate::DEFAULT_CHUNK_SIZE,
            yield_every: crate::DEFAULT_YIELD_EVERY,
        }
    }
}

/// Liveness probe configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusConfig {
    /// Interval between probe cycles
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Per-identifier fallback probe timeout
    #[serde(with = "humantime_serde")]
    pub probe_timeout: Duration,
    /// Delay between probe conduit open and close
    #[serde(with = "humantime_serde")]
    pub probe_close_delay: Duration,
    /// Timeout for the bulk peer-list query
    #[serde(with = "humantime_serde")]
    pub query_timeout: Duration,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
            probe_close_delay: Duration::from_millis(500),
            query_timeout: Duration::from_secs(3),
        }
    }
}

impl Config {
    /// Load configuration from the default location.
    ///
    /// If the configuration file doesn't exist, returns the default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration file exists but cannot be read or parsed.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::ConfigError(format!("Failed to read config: {e}")))?;

        toml::from_str(&content).map_err(|e| Error::ConfigError(format!("Failed to parse config: {e}")))
    }

    /// Save configuration to the default location.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be written.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path())
    }

    /// Save configuration to a specific file, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be written.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::ConfigError(format!("Failed to create config directory: {e}"))
            })?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| Error::ConfigError(format!("Failed to write config: {e}")))
    }

    /// Get the default configuration directory path.
    #[must_use]
    pub fn config_dir() -> Option<PathBuf> {
        project_dirs().map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the default data directory path (identity, address book, staging).
    #[must_use]
    pub fn data_dir() -> Option<PathBuf> {
        project_dirs().map(|dirs| dirs.data_dir().to_path_buf())
    }

    /// Get the full path to the configuration file.
    #[must_use]
    pub fn config_path() -> PathBuf {
        Self::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("config.toml")
    }

    /// Directory where received files land.
    #[must_use]
    pub fn download_dir(&self) -> PathBuf {
        self.general.download_dir.clone().unwrap_or_else(|| {
            directories::UserDirs::new()
                .and_then(|dirs| dirs.download_dir().map(Path::to_path_buf))
                .unwrap_or_else(|| PathBuf::from("."))
        })
    }

    /// Read a value by dotted key (e.g. `broker.host`).
    ///
    /// # Errors
    ///
    /// Returns an error if the key does not exist.
    pub fn get(&self, key: &str) -> Result<String> {
        let value = toml::Value::try_from(self)
            .map_err(|e| Error::ConfigError(format!("Failed to serialize config: {e}")))?;

        let mut current = &value;
        for part in key.split('.') {
            current = current.get(part).ok_or_else(|| Error::InvalidConfig {
                key: key.to_string(),
                reason: "unknown key".to_string(),
            })?;
        }

        Ok(match current {
            toml::Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }

    /// Set a value by dotted key, validating it against the schema.
    ///
    /// # Errors
    ///
    /// Returns an error if the key does not exist or the value has the wrong type.
    pub fn set(&mut self, key: &str, raw: &str) -> Result<()> {
        let mut value = toml::Value::try_from(&*self)
            .map_err(|e| Error::ConfigError(format!("Failed to serialize config: {e}")))?;

        let invalid = |reason: &str| Error::InvalidConfig {
            key: key.to_string(),
            reason: reason.to_string(),
        };

        let (section, field) = key.split_once('.').ok_or_else(|| invalid("expected section.field"))?;
        let table = value
            .get_mut(section)
            .and_then(toml::Value::as_table_mut)
            .ok_or_else(|| invalid("unknown section"))?;

        let parsed = match table.get(field) {
            Some(toml::Value::Integer(_)) => raw
                .parse::<i64>()
                .map(toml::Value::Integer)
                .map_err(|_| invalid("expected an integer"))?,
            Some(toml::Value::Boolean(_)) => raw
                .parse::<bool>()
                .map(toml::Value::Boolean)
                .map_err(|_| invalid("expected true or false"))?,
            Some(toml::Value::Array(_)) => toml::Value::Array(
                raw.split(',')
                    .map(|s| toml::Value::String(s.trim().to_string()))
                    .collect(),
            ),
            Some(_) => toml::Value::String(raw.to_string()),
            // Optional fields are omitted when unset; only string options exist.
            None if matches!(key, "security.unattended_secret" | "general.download_dir") => {
                toml::Value::String(raw.to_string())
            }
            None => return Err(invalid("unknown key")),
        };
        table.insert(field.to_string(), parsed);

        *self = value
            .try_into()
            .map_err(|e: toml::de::Error| invalid(&e.to_string()))?;
        Ok(())
    }
}

fn project_dirs() -> Option<directories::ProjectDirs> {
    directories::ProjectDirs::from("com", "deskbridge", "DeskBridge")
}

mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.strip_suffix("ms")
            .map(|millis| {
                millis
                    .parse()
                    .map(Duration::from_millis)
                    .map_err(serde::de::Error::custom)
            })
            .or_else(|| {
                s.strip_suffix('s').map(|secs| {
                    secs.parse()
                        .map(Duration::from_secs)
                        .map_err(serde::de::Error::custom)
                })
            })
            .or_else(|| {
                s.strip_suffix('m').map(|mins| {
                    mins.parse::<u64>()
                        .map(|m| Duration::from_secs(m * 60))
                        .map_err(serde::de::Error::custom)
                })
            })
            .unwrap_or_else(|| Err(serde::de::Error::custom("invalid duration format")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_config_default() {
        let config = Config::default();

        assert!(config.broker.is_cloud());
        assert_eq!(config.session.connect_timeout, Duration::from_secs(30));
        assert_eq!(config.transfer.chunk_size, 64 * 1024);
        assert_eq!(config.status.probe_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_config_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config").join("config.toml");

        let mut original = Config::default();
        original.general.device_name = "Test Device".to_string();
        original.broker.host = "10.0.0.5".to_string();
        original.security.unattended_secret = Some("hunter2".to_string());
        original.status.probe_close_delay = Duration::from_millis(250);

        original.save_to(&config_path).expect("save");
        let loaded = Config::load_from(&config_path).expect("load");

        assert_eq!(loaded.general.device_name, "Test Device");
        assert_eq!(loaded.broker.host, "10.0.0.5");
        assert_eq!(loaded.security.unattended_secret.as_deref(), Some("hunter2"));
        assert_eq!(loaded.status.probe_close_delay, Duration::from_millis(250));
    }

    #[test]
    fn test_config_deserialization_partial() {
        let partial_toml = r#"
[broker]
host = "192.168.1.10"

[session]
connect_timeout = "45s"
"#;

        let config: Config = toml::from_str(partial_toml).expect("parse partial config");

        assert_eq!(config.broker.host, "192.168.1.10");
        assert_eq!(config.broker.port, crate::DEFAULT_BROKER_PORT);
        assert_eq!(config.session.connect_timeout, Duration::from_secs(45));
        assert_eq!(config.session.heartbeat_interval, Duration::from_secs(3));
        assert!(config.session.clipboard_sync);
        assert_eq!(
            config.session.clipboard_poll_interval,
            Duration::from_millis(1500)
        );
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config = Config::load_from(&temp_dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.session.recent_limit, crate::DEFAULT_RECENT_LIMIT);
    }

    #[test]
    fn test_config_path() {
        let path = Config::config_path();
        assert!(path.ends_with("config.toml"));
    }

    #[test]
    fn test_peer_list_urls() {
        let mut broker = BrokerConfig::default();
        assert!(broker.peer_list_urls().is_empty());

        broker.host = "10.0.0.2".to_string();
        assert_eq!(
            broker.peer_list_urls(),
            vec![
                "http://10.0.0.2:9000/peerjs/peerjs/peers".to_string(),
                "http://10.0.0.2:9000/peerjs/peers".to_string(),
                "http://10.0.0.2:9000/peers".to_string(),
            ]
        );
    }

    #[test]
    fn test_get_and_set() {
        let mut config = Config::default();
        config.set("broker.host", "10.1.1.1").unwrap();
        config.set("broker.port", "9100").unwrap();
        config.set("security.allow_passwordless", "false").unwrap();
        config.set("session.connect_timeout", "20s").unwrap();
        config.set("session.clipboard_sync", "false").unwrap();
        config.set("security.unattended_secret", "s3cret").unwrap();

        assert_eq!(config.get("broker.host").unwrap(), "10.1.1.1");
        assert_eq!(config.broker.port, 9100);
        assert!(!config.security.allow_passwordless);
        assert_eq!(config.session.connect_timeout, Duration::from_secs(20));
        assert!(!config.session.clipboard_sync);
        assert_eq!(config.security.unattended_secret.as_deref(), Some("s3cret"));

        assert!(config.set("broker.port", "not-a-number").is_err());
        assert!(config.set("nope.field", "x").is_err());
        assert!(config.get("broker.missing").is_err());
    }

    #[test]
    fn test_humantime_duration_serialization() {
        let config = Config::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize");

        assert!(toml_str.contains("connect_timeout = \"30s\""));
        assert!(toml_str.contains("probe_close_delay = \"500ms\""));
    }
}
