//! Configuration management

use crate::pool::DEFAULT_CAPACITY;
use crate::server::DEFAULT_MAX_CONNECTIONS;
use crate::transport::TransportConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Client configuration
    pub client: Option<ClientConfig>,
    /// Server configuration
    pub server: Option<ServerConfig>,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse(content: &str) -> Result<Self, crate::Error> {
        toml::from_str(content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }

    pub fn to_toml(&self) -> Result<String, crate::Error> {
        toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("Failed to serialize config: {}", e)))
    }
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Local SOCKS5 listen address
    pub listen: String,
    /// Tunnel server address
    pub server: String,
    /// Shared password the tunnel key is derived from
    pub password: String,
    /// Maximum idle tunnel connections kept for reuse
    pub pool_capacity: usize,
    /// Reuse counter listen address
    pub stats_listen: Option<String>,
    /// Connect timeout towards the tunnel server, in seconds
    pub connect_timeout: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:1080".to_string(),
            server: "127.0.0.1:4567".to_string(),
            password: String::new(),
            pool_capacity: DEFAULT_CAPACITY,
            stats_listen: None,
            connect_timeout: 10,
        }
    }
}

impl ClientConfig {
    /// Transport settings for dialing the tunnel server
    pub fn transport(&self) -> TransportConfig {
        TransportConfig {
            connect_timeout: Duration::from_secs(self.connect_timeout),
            ..TransportConfig::default()
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Tunnel listen address
    pub listen: String,
    /// Shared password the tunnel key is derived from
    pub password: String,
    /// Maximum concurrently served tunnel connections
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:4567".to_string(),
            password: String::new(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (pretty, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

/// Generate example configuration
pub fn generate_example_config() -> Config {
    Config {
        client: Some(ClientConfig {
            password: "change-me".to_string(),
            stats_listen: Some("127.0.0.1:4568".to_string()),
            ..ClientConfig::default()
        }),
        server: Some(ServerConfig {
            password: "change-me".to_string(),
            ..ServerConfig::default()
        }),
        logging: LoggingConfig::default(),
    }
}
