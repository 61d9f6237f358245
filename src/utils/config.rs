//! Configuration management for the messaging core.
//!
//! This module provides TOML-based configuration with support for multiple
//! configuration sources (default, file-based, environment variables) and
//! validation of configuration parameters. Transport settings are a closed
//! tagged variant per transport kind and are validated when loaded.

use crate::utils::{ConfigError, Result};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file name
pub const DEFAULT_CONFIG_FILE: &str = "messenger.toml";

/// Environment variable prefix for configuration
pub const ENV_PREFIX: &str = "MESSENGER";

/// Complete configuration for the messenger
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessengerConfig {
    /// Network configuration
    pub network: NetworkConfig,
    /// Cryptographic configuration
    pub crypto: CryptoConfig,
    /// Storage configuration
    pub storage: StorageConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Network and transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Transports to register, one entry per kind
    pub transports: Vec<TransportConfig>,
    /// Timeout for a single dial attempt in milliseconds
    pub dial_timeout_ms: u64,
    /// Dial attempts per transport before moving on
    pub dial_attempts: u32,
    /// Base delay for exponential backoff between attempts in milliseconds
    pub backoff_base_ms: u64,
    /// Maximum backoff delay in milliseconds
    pub backoff_max_ms: u64,
    /// Hard cap on cached peer connections
    pub max_connections: usize,
    /// Depth of the per-connection send queue
    pub send_queue_depth: usize,
    /// Largest frame accepted from any stream in bytes
    pub max_frame_size: usize,
}

/// Per-transport settings. Each variant is validated on its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportConfig {
    /// Short-range radio
    Radio(RadioConfig),
    /// Peer data channel with out-of-band signaling
    DataChannel(DataChannelConfig),
    /// Direct socket with multicast discovery
    Socket(SocketConfig),
    /// Rendezvous relay server
    Relay(RelayConfig),
}

/// Short-range radio settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RadioConfig {
    /// Advertised service identifier
    pub service_id: String,
    /// Length of one scan window in milliseconds
    pub scan_window_ms: u64,
    /// How long a pairing code waits for confirmation in milliseconds
    pub pairing_timeout_ms: u64,
}

/// Data-channel settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataChannelConfig {
    /// ICE servers handed to the backend
    pub ice_servers: Vec<String>,
    /// Label of the control channel
    pub control_label: String,
    /// Label of the payload channel
    pub payload_label: String,
    /// Signaling round-trip timeout in milliseconds
    pub signaling_timeout_ms: u64,
}

/// Socket settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocketConfig {
    /// Address the listener binds to
    pub listen_addr: SocketAddr,
    /// Whether local multicast discovery runs
    pub enable_multicast: bool,
    /// Multicast group for discovery announcements
    pub multicast_group: Ipv4Addr,
    /// Multicast port
    pub multicast_port: u16,
    /// Interval between announcements in milliseconds
    pub announce_interval_ms: u64,
}

/// Relay settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Relay server identifier used in addresses
    pub server_id: String,
    /// Host:port of the relay server
    pub server_addr: String,
    /// Presence heartbeat interval in milliseconds
    pub heartbeat_interval_ms: u64,
}

/// Cryptographic configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CryptoConfig {
    /// Number of one-time prekeys generated per bundle
    pub prekey_count: usize,
    /// Maximum gap of skipped message keys per chain
    pub max_skip: u32,
    /// Hard cap on cached skipped keys per session
    pub skipped_key_cap: usize,
    /// Handshake response timeout in seconds
    pub handshake_timeout_secs: u64,
    /// Handshake retries with a fresh ephemeral key before giving up
    pub handshake_max_retries: u32,
    /// Previous sessions retained read-only per peer
    pub retained_sessions: usize,
    /// Retired group epochs kept for history
    pub retained_epochs: usize,
}

/// Storage and persistence configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Base directory for data storage
    pub data_dir: PathBuf,
    /// Directory for storing keys
    pub keys_dir: PathBuf,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            transports: vec![
                TransportConfig::Socket(SocketConfig::default()),
                TransportConfig::Relay(RelayConfig::default()),
            ],
            dial_timeout_ms: 5_000,
            dial_attempts: 3,
            backoff_base_ms: 200,
            backoff_max_ms: 5_000,
            max_connections: crate::defaults::DEFAULT_MAX_PEERS,
            send_queue_depth: 256,
            max_frame_size: crate::MAX_MESSAGE_SIZE,
        }
    }
}

impl Default for RadioConfig {
    fn default() -> Self {
        Self {
            service_id: "swm-radio".to_string(),
            scan_window_ms: 2_000,
            pairing_timeout_ms: 30_000,
        }
    }
}

impl Default for DataChannelConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            control_label: "control".to_string(),
            payload_label: "payload".to_string(),
            signaling_timeout_ms: 10_000,
        }
    }
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], crate::defaults::DEFAULT_PORT)),
            enable_multicast: true,
            multicast_group: Ipv4Addr::new(239, 255, 42, 99),
            multicast_port: 45_454,
            announce_interval_ms: 5_000,
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            server_id: "default".to_string(),
            server_addr: format!("127.0.0.1:{}", crate::defaults::DEFAULT_RELAY_PORT),
            heartbeat_interval_ms: 15_000,
        }
    }
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            prekey_count: crate::crypto::DEFAULT_PREKEY_COUNT,
            max_skip: crate::session::MAX_SKIP,
            skipped_key_cap: 2_000,
            handshake_timeout_secs: crate::defaults::DEFAULT_HANDSHAKE_TIMEOUT,
            handshake_max_retries: 3,
            retained_sessions: 2,
            retained_epochs: 4,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("secure-wallet-messenger");

        Self {
            keys_dir: data_dir.join("keys"),
            data_dir,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl TransportConfig {
    /// Short label of the transport kind
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Radio(_) => "radio",
            Self::DataChannel(_) => "data_channel",
            Self::Socket(_) => "socket",
            Self::Relay(_) => "relay",
        }
    }

    /// Validate the settings of this transport variant
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Radio(radio) => {
                non_empty("radio.service_id", &radio.service_id)?;
                positive("radio.scan_window_ms", radio.scan_window_ms)?;
                positive("radio.pairing_timeout_ms", radio.pairing_timeout_ms)?;
            }
            Self::DataChannel(dc) => {
                non_empty("data_channel.control_label", &dc.control_label)?;
                non_empty("data_channel.payload_label", &dc.payload_label)?;
                if dc.control_label == dc.payload_label {
                    return Err(invalid("data_channel.payload_label", &dc.payload_label));
                }
                positive("data_channel.signaling_timeout_ms", dc.signaling_timeout_ms)?;
            }
            Self::Socket(socket) => {
                if socket.enable_multicast && !socket.multicast_group.is_multicast() {
                    return Err(invalid(
                        "socket.multicast_group",
                        &socket.multicast_group.to_string(),
                    ));
                }
                positive("socket.announce_interval_ms", socket.announce_interval_ms)?;
            }
            Self::Relay(relay) => {
                non_empty("relay.server_id", &relay.server_id)?;
                if relay.server_id.contains('/') {
                    return Err(invalid("relay.server_id", &relay.server_id));
                }
                non_empty("relay.server_addr", &relay.server_addr)?;
                positive("relay.heartbeat_interval_ms", relay.heartbeat_interval_ms)?;
            }
        }
        Ok(())
    }
}

impl NetworkConfig {
    /// Dial timeout as a [`Duration`]
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    /// Backoff before the given retry attempt (1-based), capped
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(self.backoff_base_ms.saturating_mul(factor).min(self.backoff_max_ms))
    }
}

impl MessengerConfig {
    /// Load configuration from a TOML file
    ///
    /// # Errors
    ///
    /// Returns error if file cannot be read, parsed or validated
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
            path: path.display().to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(ConfigError::from)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with multiple sources (default, file, environment)
    pub fn load(config_file: Option<&Path>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(path) = config_file {
            if path.exists() {
                config = Self::from_file(path)?;
            } else {
                return Err(ConfigError::FileNotFound {
                    path: path.display().to_string(),
                }
                .into());
            }
        } else {
            let default_locations = [
                PathBuf::from(DEFAULT_CONFIG_FILE),
                dirs::config_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("secure-wallet-messenger")
                    .join(DEFAULT_CONFIG_FILE),
            ];

            if let Some(location) = default_locations.iter().find(|l| l.exists()) {
                config = Self::from_file(location)?;
            }
        }

        config = config.merge_from_env()?;
        config.validate()?;

        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        std::fs::write(path, self.to_toml_string()?)?;
        Ok(())
    }

    /// Merge configuration from environment variables
    fn merge_from_env(mut self) -> Result<Self> {
        if let Ok(timeout) = std::env::var(format!("{ENV_PREFIX}_NETWORK_DIAL_TIMEOUT_MS")) {
            self.network.dial_timeout_ms = timeout.parse().map_err(|_| ConfigError::InvalidValue {
                field: format!("{ENV_PREFIX}_NETWORK_DIAL_TIMEOUT_MS"),
                value: timeout,
            })?;
        }

        if let Ok(level) = std::env::var(format!("{ENV_PREFIX}_LOGGING_LEVEL")) {
            self.logging.level = level;
        }

        if let Ok(data_dir) = std::env::var(format!("{ENV_PREFIX}_STORAGE_DATA_DIR")) {
            self.storage.data_dir = PathBuf::from(&data_dir);
            self.storage.keys_dir = self.storage.data_dir.join("keys");
        }

        Ok(self)
    }

    /// Validate the configuration for consistency and correctness
    pub fn validate(&self) -> Result<()> {
        positive("network.dial_timeout_ms", self.network.dial_timeout_ms)?;
        positive("network.dial_attempts", u64::from(self.network.dial_attempts))?;
        positive("network.max_connections", self.network.max_connections as u64)?;
        positive("network.send_queue_depth", self.network.send_queue_depth as u64)?;
        positive("network.max_frame_size", self.network.max_frame_size as u64)?;

        let mut seen = std::collections::HashSet::new();
        for transport in &self.network.transports {
            if !seen.insert(transport.kind_name()) {
                return Err(invalid("network.transports", transport.kind_name()));
            }
            transport.validate()?;
        }

        positive("crypto.prekey_count", self.crypto.prekey_count as u64)?;
        positive("crypto.max_skip", u64::from(self.crypto.max_skip))?;
        if self.crypto.skipped_key_cap < self.crypto.max_skip as usize {
            return Err(invalid(
                "crypto.skipped_key_cap",
                &self.crypto.skipped_key_cap.to_string(),
            ));
        }
        positive("crypto.handshake_timeout_secs", self.crypto.handshake_timeout_secs)?;

        match self.logging.level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            _ => return Err(invalid("logging.level", &self.logging.level)),
        }

        Ok(())
    }

    /// Ensure all required directories exist
    pub fn ensure_directories(&self) -> Result<()> {
        for dir in [&self.storage.data_dir, &self.storage.keys_dir] {
            if !dir.exists() {
                std::fs::create_dir_all(dir).map_err(|_| ConfigError::DirectoryCreation {
                    path: dir.display().to_string(),
                })?;
            }
        }

        Ok(())
    }

    /// Get the configuration as a pretty-printed TOML string
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| {
            ConfigError::ParseError {
                reason: e.to_string(),
            }
            .into()
        })
    }
}

fn invalid(field: &str, value: &str) -> crate::utils::MessengerError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
    }
    .into()
}

fn positive(field: &str, value: u64) -> Result<()> {
    if value == 0 {
        return Err(invalid(field, "0"));
    }
    Ok(())
}

fn non_empty(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(invalid(field, value));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = MessengerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.crypto.max_skip, 1000);
        assert_eq!(config.network.transports.len(), 2);
    }

    #[test]
    fn test_config_serialization() {
        let config = MessengerConfig::default();
        let toml_str = config.to_toml_string().unwrap();
        assert!(toml_str.contains("kind = \"socket\""));
        assert!(toml_str.contains("kind = \"relay\""));
    }

    #[test]
    fn test_config_file_operations() {
        let mut config = MessengerConfig::default();
        config
            .network
            .transports
            .push(TransportConfig::Radio(RadioConfig::default()));
        let temp_file = NamedTempFile::new().unwrap();

        config.save(temp_file.path()).unwrap();
        let loaded = MessengerConfig::from_file(temp_file.path()).unwrap();

        assert_eq!(config.network.transports, loaded.network.transports);
        assert_eq!(config.crypto.prekey_count, loaded.crypto.prekey_count);
    }

    #[test]
    fn test_config_validation() {
        let mut config = MessengerConfig::default();
        config.network.dial_timeout_ms = 0;
        assert!(config.validate().is_err());

        config = MessengerConfig::default();
        config.crypto.prekey_count = 0;
        assert!(config.validate().is_err());

        config = MessengerConfig::default();
        config.logging.level = "invalid".to_string();
        assert!(config.validate().is_err());

        config = MessengerConfig::default();
        config
            .network
            .transports
            .push(TransportConfig::Socket(SocketConfig::default()));
        assert!(config.validate().is_err(), "duplicate transport kind");
    }

    #[test]
    fn test_transport_variant_validation() {
        let mut relay = RelayConfig::default();
        relay.server_id = "a/b".to_string();
        assert!(TransportConfig::Relay(relay).validate().is_err());

        let mut socket = SocketConfig::default();
        socket.multicast_group = Ipv4Addr::new(10, 0, 0, 1);
        assert!(TransportConfig::Socket(socket).validate().is_err());

        let mut dc = DataChannelConfig::default();
        dc.payload_label = dc.control_label.clone();
        assert!(TransportConfig::DataChannel(dc).validate().is_err());

        assert!(TransportConfig::Radio(RadioConfig::default()).validate().is_ok());
    }

    #[test]
    fn test_backoff_is_capped() {
        let network = NetworkConfig::default();
        assert_eq!(network.backoff(1), Duration::from_millis(200));
        assert_eq!(network.backoff(2), Duration::from_millis(400));
        assert_eq!(network.backoff(30), Duration::from_millis(5_000));
    }

    #[test]
    fn test_env_override() {
        std::env::set_var("MESSENGER_NETWORK_DIAL_TIMEOUT_MS", "1234");

        let config = MessengerConfig::default().merge_from_env().unwrap();
        assert_eq!(config.network.dial_timeout_ms, 1234);

        std::env::remove_var("MESSENGER_NETWORK_DIAL_TIMEOUT_MS");
    }
}
