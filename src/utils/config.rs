//! Configuration management for the peer-to-peer node.
//!
//! This module provides TOML-based configuration with support for multiple
//! configuration sources (default, file-based, environment variables) and
//! validation of configuration parameters.

use crate::utils::{ConfigError, NetworkError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default configuration file name
pub const DEFAULT_CONFIG_FILE: &str = "p2p-node.toml";

/// Environment variable prefix for configuration
pub const ENV_PREFIX: &str = "P2P_NODE";

/// Complete configuration for a node
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Network configuration
    pub network: NetworkConfig,
    /// Storage configuration
    pub storage: StorageConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Listener and dialing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Address the listener binds to
    pub listen_address: String,
    /// Port to listen on for peer connections
    pub listen_port: u16,
    /// Peers dialed at startup, as `host:port`
    pub bootstrap_peers: Vec<String>,
}

/// Storage and persistence configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Base directory for data storage
    pub data_dir: PathBuf,
    /// Peer list file, relative paths resolve against `data_dir`
    pub peers_file: PathBuf,
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
            listen_address: crate::defaults::DEFAULT_LISTEN_ADDRESS.to_string(),
            listen_port: crate::defaults::DEFAULT_PORT,
            bootstrap_peers: Vec::new(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("p2p-chat-node");

        Self {
            data_dir,
            peers_file: PathBuf::from(crate::defaults::DEFAULT_PEERS_FILE),
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

impl StorageConfig {
    /// Full path of the peer list file
    pub fn peers_path(&self) -> PathBuf {
        if self.peers_file.is_absolute() {
            self.peers_file.clone()
        } else {
            self.data_dir.join(&self.peers_file)
        }
    }
}

impl NodeConfig {
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
                    .join("p2p-chat-node")
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
        let content = self.to_toml_string()?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Apply `P2P_NODE_*` environment overrides
    fn merge_from_env(mut self) -> Result<Self> {
        let port_var = format!("{ENV_PREFIX}_LISTEN_PORT");
        if let Ok(port) = std::env::var(&port_var) {
            self.network.listen_port = port.parse().map_err(|_| ConfigError::InvalidValue {
                field: port_var.clone(),
                value: port,
            })?;
        }

        if let Ok(address) = std::env::var(format!("{ENV_PREFIX}_LISTEN_ADDRESS")) {
            self.network.listen_address = address;
        }

        if let Ok(peers) = std::env::var(format!("{ENV_PREFIX}_BOOTSTRAP_PEERS")) {
            self.network.bootstrap_peers = peers
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect();
        }

        if let Ok(level) = std::env::var(format!("{ENV_PREFIX}_LOG_LEVEL")) {
            self.logging.level = level;
        }

        if let Ok(data_dir) = std::env::var(format!("{ENV_PREFIX}_DATA_DIR")) {
            self.storage.data_dir = PathBuf::from(data_dir);
        }

        Ok(self)
    }

    /// Validate the configuration for consistency and correctness
    pub fn validate(&self) -> Result<()> {
        if self.network.listen_port == 0 {
            return Err(ConfigError::InvalidValue {
                field: "network.listen_port".to_string(),
                value: "0".to_string(),
            }
            .into());
        }

        if self.network.listen_address.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "network.listen_address".to_string(),
                value: self.network.listen_address.clone(),
            }
            .into());
        }

        for peer in &self.network.bootstrap_peers {
            parse_peer_address(peer).map_err(|_| ConfigError::InvalidValue {
                field: "network.bootstrap_peers".to_string(),
                value: peer.clone(),
            })?;
        }

        match self.logging.level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            _ => {
                return Err(ConfigError::InvalidValue {
                    field: "logging.level".to_string(),
                    value: self.logging.level.clone(),
                }
                .into());
            }
        }

        Ok(())
    }

    /// Ensure all required directories exist
    pub fn ensure_directories(&self) -> Result<()> {
        let mut dirs_to_create = vec![self.storage.data_dir.clone()];
        if let Some(parent) = self.storage.peers_path().parent() {
            dirs_to_create.push(parent.to_path_buf());
        }

        for dir in &dirs_to_create {
            if !dir.as_os_str().is_empty() && !dir.exists() {
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

/// Split a `host:port` string.
///
/// The port is taken after the last colon, so bracketed IPv6 literals such as
/// `[::1]:9000` work; the brackets are stripped from the host.
pub fn parse_peer_address(address: &str) -> Result<(String, u16)> {
    let invalid = || NetworkError::InvalidAddress {
        address: address.to_string(),
    };

    let (host, port) = address.rsplit_once(':').ok_or_else(invalid)?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(invalid().into());
    }
    let port: u16 = port.parse().map_err(|_| invalid())?;

    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = NodeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.network.listen_port, crate::defaults::DEFAULT_PORT);
        assert!(config.network.bootstrap_peers.is_empty());
    }

    #[test]
    fn test_config_serialization() {
        let config = NodeConfig::default();
        let toml_str = config.to_toml_string().unwrap();
        assert!(toml_str.contains("listen_port"));
        assert!(toml_str.contains("peers_file"));
    }

    #[test]
    fn test_config_file_operations() {
        let mut config = NodeConfig::default();
        config.network.bootstrap_peers = vec!["localhost:9001".to_string()];
        let temp_file = NamedTempFile::new().unwrap();

        config.save(temp_file.path()).unwrap();
        let loaded = NodeConfig::from_file(temp_file.path()).unwrap();

        assert_eq!(config.network.listen_port, loaded.network.listen_port);
        assert_eq!(config.network.bootstrap_peers, loaded.network.bootstrap_peers);
    }

    #[test]
    fn test_config_validation() {
        let mut config = NodeConfig::default();
        assert!(config.validate().is_ok());

        config.network.listen_port = 0;
        assert!(config.validate().is_err());

        config = NodeConfig::default();
        config.network.bootstrap_peers = vec!["no-port".to_string()];
        assert!(config.validate().is_err());

        config = NodeConfig::default();
        config.logging.level = "invalid".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_explicit_file() {
        let result = NodeConfig::load(Some(Path::new("/definitely/not/here.toml")));
        assert!(result.is_err());
    }

    #[test]
    fn test_env_override() {
        std::env::set_var("P2P_NODE_LISTEN_PORT", "9999");

        let config = NodeConfig::default().merge_from_env().unwrap();
        assert_eq!(config.network.listen_port, 9999);

        std::env::remove_var("P2P_NODE_LISTEN_PORT");
    }

    #[test]
    fn test_peers_path() {
        let mut storage = StorageConfig::default();
        assert!(storage.peers_path().starts_with(&storage.data_dir));

        storage.peers_file = PathBuf::from("/tmp/elsewhere/peers.txt");
        assert_eq!(storage.peers_path(), PathBuf::from("/tmp/elsewhere/peers.txt"));
    }

    #[test]
    fn test_parse_peer_address() {
        assert_eq!(
            parse_peer_address("localhost:8080").unwrap(),
            ("localhost".to_string(), 8080)
        );
        assert_eq!(
            parse_peer_address("[::1]:9000").unwrap(),
            ("::1".to_string(), 9000)
        );
        assert!(parse_peer_address("localhost").is_err());
        assert!(parse_peer_address(":80").is_err());
        assert!(parse_peer_address("host:99999").is_err());
    }
}
