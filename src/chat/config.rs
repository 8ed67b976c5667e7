//! Server and client configuration.
//!
//! Both configs load from a TOML file when one exists and fall back to the
//! defaults below for any missing field.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::chat::error::ChatError;
use crate::crypto::DEFAULT_MODULUS_BITS;

/// Application directory name under the platform config dir.
pub const APP_DIR: &str = "aioserver";

/// Default listen address.
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8888";

/// Default address the client connects to.
pub const DEFAULT_SERVER_ADDR: &str = "127.0.0.1:8888";

/// Default key file name inside the app directory.
pub const DEFAULT_KEY_FILE: &str = "server_key.hex";

/// Default maximum frame size (1 MiB).
pub const DEFAULT_MAX_FRAME_LEN: usize = 1024 * 1024;

/// Default idle timeout while a handshake is in progress.
pub const DEFAULT_HANDSHAKE_TIMEOUT_SECS: u64 = 30;

/// Default number of consecutive bad messages before a connection is dropped.
pub const DEFAULT_MAX_CONSECUTIVE_FAILURES: u32 = 3;

/// Default dispatcher queue depth.
pub const DEFAULT_DISPATCHER_CAPACITY: usize = 1;

/// Default per-connection outbound queue depth.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 16;

/// Default chat bot history length.
pub const DEFAULT_HISTORY_LEN: usize = 10;

/// Platform config directory for this application.
pub fn config_dir() -> Result<PathBuf, ChatError> {
    dirs::config_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join(".config")))
        .map(|dir| dir.join(APP_DIR))
        .ok_or_else(|| ChatError::ConfigError("Could not find config directory".to_string()))
}

/// Default location of the server key.
pub fn default_key_path() -> PathBuf {
    config_dir()
        .unwrap_or_else(|_| PathBuf::from(APP_DIR))
        .join(DEFAULT_KEY_FILE)
}

fn load_toml<T>(path: &Path) -> Result<T, ChatError>
where
    T: Default + for<'de> Deserialize<'de>,
{
    if !path.exists() {
        return Ok(T::default());
    }
    let content = fs::read_to_string(path)?;
    toml::from_str(&content)
        .map_err(|e| ChatError::ConfigError(format!("Failed to parse {}: {}", path.display(), e)))
}

fn save_toml<T: Serialize>(value: &T, path: &Path) -> Result<(), ChatError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let content =
        toml::to_string_pretty(value).map_err(|e| ChatError::ConfigError(e.to_string()))?;
    fs::write(path, content)?;
    Ok(())
}

/// Server settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to listen on.
    pub bind_addr: String,

    /// Where the server's RSA private key lives.
    pub key_path: PathBuf,

    /// Passphrase the key file is encrypted with, if any.
    pub key_passphrase: Option<String>,

    /// Modulus size for a freshly generated key.
    pub modulus_bits: usize,

    /// Largest frame accepted or sent.
    pub max_frame_len: usize,

    /// Idle timeout between handshake steps.
    pub handshake_timeout_secs: u64,

    /// Bad messages in a row that fault a connection.
    pub max_consecutive_failures: u32,

    pub dispatcher_capacity: usize,

    pub outbound_capacity: usize,

    /// Lines the chat bot keeps for late subscribers.
    pub history_len: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            key_path: default_key_path(),
            key_passphrase: None,
            modulus_bits: DEFAULT_MODULUS_BITS,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            handshake_timeout_secs: DEFAULT_HANDSHAKE_TIMEOUT_SECS,
            max_consecutive_failures: DEFAULT_MAX_CONSECUTIVE_FAILURES,
            dispatcher_capacity: DEFAULT_DISPATCHER_CAPACITY,
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
            history_len: DEFAULT_HISTORY_LEN,
        }
    }
}

impl ServerConfig {
    /// Loads from `path`, or returns the defaults if the file does not exist.
    pub fn load(path: &Path) -> Result<Self, ChatError> {
        load_toml(path)
    }

    /// Default config file location.
    pub fn config_path() -> Result<PathBuf, ChatError> {
        Ok(config_dir()?.join("server.toml"))
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

/// Client settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ClientConfig {
    pub server_addr: String,

    /// Name announced during the handshake. Required before connecting.
    pub username: String,

    /// Modulus size of the per-session client key.
    pub modulus_bits: usize,

    pub max_frame_len: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: DEFAULT_SERVER_ADDR.to_string(),
            username: String::new(),
            modulus_bits: DEFAULT_MODULUS_BITS,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

impl ClientConfig {
    /// Loads from `path`, or returns the defaults if the file does not exist.
    pub fn load(path: &Path) -> Result<Self, ChatError> {
        load_toml(path)
    }

    pub fn save(&self, path: &Path) -> Result<(), ChatError> {
        save_toml(self, path)
    }

    /// Default config file location.
    pub fn config_path() -> Result<PathBuf, ChatError> {
        Ok(config_dir()?.join("client.toml"))
    }
}
