//! Post office configuration.

use std::path::Path;

use base64::{Engine, engine::general_purpose::STANDARD};
use courier_proto::DEFAULT_PORT;
use serde::{Deserialize, Serialize};

use crate::error::OfficeError;

/// Parameters of one post office process.
///
/// Loaded from JSON; invalid configuration is fatal at startup, the post
/// office refuses to run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfficeConfig {
    /// Post office name; must be unique at the central post office.
    pub name: String,

    /// Shared secret, base64.
    pub secret: String,

    /// Mailbox receive queue capacity.
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,

    /// Host of the central post office.
    pub cpo_host: String,

    /// Port of the central post office.
    #[serde(default = "default_port")]
    pub cpo_port: u16,

    /// Frame size limit used until the central post office announces its
    /// own during the handshake.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

fn default_queue_size() -> usize {
    32
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_max_message_size() -> usize {
    65536
}

impl OfficeConfig {
    /// Read and validate a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, OfficeError> {
        let text = std::fs::read_to_string(path)?;
        let config: Self =
            serde_json::from_str(&text).map_err(|e| OfficeError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check every field; any violation refuses startup.
    pub fn validate(&self) -> Result<(), OfficeError> {
        if self.name.is_empty() {
            return Err(OfficeError::Config("post office name is empty".to_string()));
        }
        if self.name.contains('.') {
            return Err(OfficeError::Config("post office name contains '.'".to_string()));
        }
        if self.name == courier_proto::CENTRAL_NAME {
            return Err(OfficeError::Config(format!(
                "post office name '{}' is reserved for the central post office",
                self.name
            )));
        }
        self.secret_bytes()?;
        if self.queue_size == 0 {
            return Err(OfficeError::Config("queue size must be at least 1".to_string()));
        }
        if self.cpo_host.is_empty() {
            return Err(OfficeError::Config("central post office host is empty".to_string()));
        }
        if self.cpo_port == 0 {
            return Err(OfficeError::Config("central post office port is out of range".to_string()));
        }
        if self.max_message_size < 64 {
            return Err(OfficeError::Config("max message size is too small".to_string()));
        }
        Ok(())
    }

    /// The decoded shared secret.
    pub fn secret_bytes(&self) -> Result<Vec<u8>, OfficeError> {
        let bytes = STANDARD
            .decode(&self.secret)
            .map_err(|e| OfficeError::Config(format!("secret is not valid base64: {e}")))?;
        if bytes.is_empty() {
            return Err(OfficeError::Config("secret is empty".to_string()));
        }
        Ok(bytes)
    }
}
