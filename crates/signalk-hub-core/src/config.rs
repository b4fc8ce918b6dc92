//! Hub configuration.
//!
//! The configuration is a camelCase JSON file; every field has a default, so
//! an empty object (or no file at all) gives a working local hub:
//!
//! ```json
//! { "selfId": "urn:mrn:signalk:uuid:...", "wsAddr": "0.0.0.0:3000", "minPeriodMs": 100 }
//! ```

use std::net::SocketAddr;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Errors that can occur while loading the configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Settings for one hub process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HubConfig {
    /// Server name sent in the Hello message.
    pub name: String,
    /// Signal K version advertised to clients.
    pub version: String,
    /// Local vessel id; `self` resolves to it.
    pub self_id: String,
    /// WebSocket listener.
    pub ws_addr: SocketAddr,
    /// Line-delimited TCP listener.
    pub tcp_addr: SocketAddr,
    /// HTTP API listener.
    pub http_addr: SocketAddr,
    /// Period used when a subscription names none.
    pub default_period_ms: u64,
    /// Shortest period a subscription may ask for.
    pub min_period_ms: u64,
    /// Capacity of the ingestion queue.
    pub ingest_queue: usize,
    /// Per-session outbound buffer, in messages.
    pub session_queue: usize,
    /// Feed simulated sensor data into the hub.
    pub demo: bool,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            name: "signalk-hub".to_string(),
            version: "1.7.0".to_string(),
            self_id: "urn:mrn:signalk:uuid:00000000-0000-0000-0000-000000000000".to_string(),
            ws_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            tcp_addr: SocketAddr::from(([0, 0, 0, 0], 5555)),
            http_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            default_period_ms: 1000,
            min_period_ms: 100,
            ingest_queue: 1024,
            session_queue: 256,
            demo: false,
        }
    }
}

impl HubConfig {
    /// Parse and validate a JSON configuration.
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: HubConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let id = self.self_id.strip_prefix("vessels.").unwrap_or(&self.self_id);
        if id.is_empty() || id.contains('.') {
            return Err(ConfigError::Invalid(format!(
                "selfId {:?} must be a single path segment",
                self.self_id
            )));
        }
        if id == "self" {
            return Err(ConfigError::Invalid("selfId cannot be the alias itself".to_string()));
        }
        if self.min_period_ms == 0 {
            return Err(ConfigError::Invalid("minPeriodMs must be positive".to_string()));
        }
        if self.default_period_ms < self.min_period_ms {
            return Err(ConfigError::Invalid(format!(
                "defaultPeriodMs ({}) is below minPeriodMs ({})",
                self.default_period_ms, self.min_period_ms
            )));
        }
        if self.ingest_queue == 0 || self.session_queue == 0 {
            return Err(ConfigError::Invalid("queue sizes must be positive".to_string()));
        }
        Ok(())
    }

    /// The local vessel context, `vessels.<selfId>`.
    pub fn self_context(&self) -> String {
        let id = self.self_id.strip_prefix("vessels.").unwrap_or(&self.self_id);
        format!("vessels.{}", id)
    }
}
