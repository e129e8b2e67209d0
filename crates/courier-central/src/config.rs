//! Broker configuration and its persistence.
//!
//! The broker loads its configuration once at startup and refuses to run
//! on any violation. `manage.write` persists the current client table back
//! through a [`ConfigStore`], so managers can add or delete clients at
//! runtime and keep the change across restarts.

use std::path::{Path, PathBuf};

use base64::{Engine, engine::general_purpose::STANDARD};
use courier_proto::{CENTRAL_NAME, DEFAULT_PORT, MAX_FRAME_PAYLOAD};
use serde::{Deserialize, Serialize};

use crate::error::CentralError;

/// What to do when an outbound client queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OverflowPolicy {
    /// Drop the arriving frame and log.
    #[default]
    DropNewest,
    /// Evict the oldest queued frame to make room.
    DropOldest,
}

/// One configured client post office.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientEntry {
    /// Post office name; unique at this broker.
    pub name: String,
    /// Shared secret, base64.
    pub secret: String,
    /// Whether this client may issue management operations.
    #[serde(default)]
    pub manager: bool,
}

impl ClientEntry {
    /// The decoded shared secret.
    pub fn secret_bytes(&self) -> Result<Vec<u8>, CentralError> {
        let bytes = STANDARD.decode(&self.secret).map_err(|e| {
            CentralError::Config(format!("secret of client '{}' is not valid base64: {e}", self.name))
        })?;
        if bytes.is_empty() {
            return Err(CentralError::Config(format!("secret of client '{}' is empty", self.name)));
        }
        Ok(bytes)
    }
}

/// Parameters of the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CentralConfig {
    /// Instance label used in status reports.
    pub name: String,

    /// Address to bind on.
    #[serde(default = "default_local_address")]
    pub local_address: String,

    /// TCP port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// How often connected clients are pinged, in milliseconds. A client
    /// silent for 1.5 times this interval is disconnected.
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,

    /// Frame payload size limit, announced to clients at handshake.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Outbound queue overflow policy.
    #[serde(default)]
    pub overflow: OverflowPolicy,

    /// The client post offices allowed to connect.
    pub clients: Vec<ClientEntry>,
}

fn default_local_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_ping_interval_ms() -> u64 {
    5000
}

fn default_max_message_size() -> usize {
    65536
}

impl CentralConfig {
    /// Read and validate a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CentralError> {
        let text = std::fs::read_to_string(path)?;
        let config: Self =
            serde_json::from_str(&text).map_err(|e| CentralError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check every field; any violation refuses startup.
    pub fn validate(&self) -> Result<(), CentralError> {
        if self.name.is_empty() {
            return Err(CentralError::Config("broker name is empty".to_string()));
        }
        if self.local_address.is_empty() {
            return Err(CentralError::Config("local address is empty".to_string()));
        }
        if self.port == 0 {
            return Err(CentralError::Config("port is out of range".to_string()));
        }
        if self.ping_interval_ms == 0 {
            return Err(CentralError::Config("ping interval must be positive".to_string()));
        }
        if self.max_message_size < 64 || self.max_message_size > MAX_FRAME_PAYLOAD {
            return Err(CentralError::Config(format!(
                "max message size must be between 64 and {MAX_FRAME_PAYLOAD}"
            )));
        }
        let mut seen = std::collections::HashSet::new();
        for client in &self.clients {
            if client.name.is_empty() {
                return Err(CentralError::Config("client name is empty".to_string()));
            }
            if client.name.contains('.') {
                return Err(CentralError::Config(format!(
                    "client name '{}' contains '.'",
                    client.name
                )));
            }
            if client.name == CENTRAL_NAME {
                return Err(CentralError::Config(format!(
                    "client name '{}' is reserved",
                    client.name
                )));
            }
            if !seen.insert(client.name.as_str()) {
                return Err(CentralError::Config(format!(
                    "client name '{}' is duplicated",
                    client.name
                )));
            }
            client.secret_bytes()?;
        }
        Ok(())
    }
}

/// Persistence hook for `manage.write`.
pub trait ConfigStore: Send + Sync {
    /// Persist the current configuration.
    fn save(&self, config: &CentralConfig) -> Result<(), CentralError>;
}

/// JSON file store; writes the configuration back where it was loaded
/// from.
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    /// Store writing to the given path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ConfigStore for FileStore {
    fn save(&self, config: &CentralConfig) -> Result<(), CentralError> {
        let text = serde_json::to_vec_pretty(config)
            .map_err(|e| CentralError::Config(e.to_string()))?;
        std::fs::write(&self.path, text)?;
        Ok(())
    }
}

/// Store that discards writes; used when persistence is not wanted.
pub struct NullStore;

impl ConfigStore for NullStore {
    fn save(&self, _config: &CentralConfig) -> Result<(), CentralError> {
        Ok(())
    }
}
