//! Server settings
//!
//! Loads server settings from a TOML file. Every field has a default so a
//! missing file, or a file that only sets a few keys, is valid.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default settings file name, looked up in the working directory
pub const DEFAULT_CONFIG_FILE: &str = "dreams-chat.toml";

/// Errors that can occur while loading settings
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Listener settings for the HTTP API and the WebSocket relay
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerSection {
    /// Address both listeners bind to
    #[serde(default = "default_bind")]
    pub bind: String,
    /// HTTP API port
    #[serde(default = "default_api_port")]
    pub api_port: u16,
    /// WebSocket relay port
    #[serde(default = "default_ws_port")]
    pub ws_port: u16,
    /// Directory served for paths the API does not route
    #[serde(default)]
    pub static_dir: Option<PathBuf>,
}

/// Database settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatabaseSection {
    /// SQLite database file
    #[serde(default = "default_database_path")]
    pub path: PathBuf,
}

/// Credential settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuthSection {
    /// Lifetime of a login token in seconds
    #[serde(default = "default_token_ttl_secs")]
    pub token_ttl_secs: u64,
    /// Shortest accepted password
    #[serde(default = "default_min_password_len")]
    pub min_password_len: usize,
    /// bcrypt cost of new password digests (4 to 31)
    #[serde(default = "default_bcrypt_cost")]
    pub bcrypt_cost: u32,
}

/// Relay delivery policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RelaySection {
    /// Deliver a message back to the connection that sent it
    #[serde(default = "default_echo_to_sender")]
    pub echo_to_sender: bool,
    /// Capacity of each connection's outbound queue
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,
    /// Upper bound on a single socket write, in milliseconds
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
    /// Longest accepted message text, in bytes
    #[serde(default = "default_max_text_len")]
    pub max_text_len: usize,
}

fn default_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_api_port() -> u16 {
    8000
}

fn default_ws_port() -> u16 {
    9000
}

fn default_database_path() -> PathBuf {
    PathBuf::from("dreams-chat.db")
}

fn default_token_ttl_secs() -> u64 {
    7 * 24 * 60 * 60
}

fn default_min_password_len() -> usize {
    6
}

fn default_bcrypt_cost() -> u32 {
    12
}

fn default_echo_to_sender() -> bool {
    true
}

fn default_outbound_queue() -> usize {
    64
}

fn default_send_timeout_ms() -> u64 {
    5_000
}

fn default_max_text_len() -> usize {
    16 * 1024
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            api_port: default_api_port(),
            ws_port: default_ws_port(),
            static_dir: None,
        }
    }
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            token_ttl_secs: default_token_ttl_secs(),
            min_password_len: default_min_password_len(),
            bcrypt_cost: default_bcrypt_cost(),
        }
    }
}

impl Default for RelaySection {
    fn default() -> Self {
        Self {
            echo_to_sender: default_echo_to_sender(),
            outbound_queue: default_outbound_queue(),
            send_timeout_ms: default_send_timeout_ms(),
            max_text_len: default_max_text_len(),
        }
    }
}

/// Root settings
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub database: DatabaseSection,
    #[serde(default)]
    pub auth: AuthSection,
    #[serde(default)]
    pub relay: RelaySection,
}

impl Settings {
    /// Load settings from a file, falling back to defaults when it does not exist
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse settings from TOML text
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let settings: Settings = toml::from_str(content)?;
        Ok(settings)
    }

    /// Check cross-field constraints after file and CLI values are merged
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.api_port != 0 && self.server.api_port == self.server.ws_port {
            return Err(ConfigError::Invalid(format!(
                "api_port and ws_port must differ (both {})",
                self.server.api_port
            )));
        }
        if self.relay.outbound_queue == 0 {
            return Err(ConfigError::Invalid(
                "relay.outbound_queue must be at least 1".to_string(),
            ));
        }
        if self.relay.send_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "relay.send_timeout_ms must be at least 1".to_string(),
            ));
        }
        if self.relay.max_text_len == 0 {
            return Err(ConfigError::Invalid(
                "relay.max_text_len must be at least 1".to_string(),
            ));
        }
        if self.auth.token_ttl_secs == 0 {
            return Err(ConfigError::Invalid(
                "auth.token_ttl_secs must be at least 1".to_string(),
            ));
        }
        if !(4..=31).contains(&self.auth.bcrypt_cost) {
            return Err(ConfigError::Invalid(format!(
                "auth.bcrypt_cost must be between 4 and 31, got {}",
                self.auth.bcrypt_cost
            )));
        }
        Ok(())
    }

    /// Socket address of the HTTP API
    pub fn api_addr(&self) -> String {
        format!("{}:{}", self.server.bind, self.server.api_port)
    }

    /// Token lifetime
    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.auth.token_ttl_secs)
    }

    /// Per-write timeout for relay sockets
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.relay.send_timeout_ms)
    }
}
