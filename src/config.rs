//! Server configuration.
//!
//! [`ServerConfig`] can be built in code or loaded from TOML; every field has
//! a default, so a config file only lists what it changes:
//!
//! ```toml
//! idle_timeout_secs = 30
//! max_body_size = 1048576
//!
//! [websocket]
//! max_payload = 65536
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::realtime::WsOptions;

/// Errors produced while loading a configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Settings applied to every connection of one server.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Seconds a connection may sit idle before it is closed.
    pub idle_timeout_secs: u64,
    /// Largest accepted request head, in bytes (431 beyond it).
    pub max_head_size: usize,
    /// Largest request body a handler may buffer, in bytes.
    pub max_body_size: usize,
    /// Defaults for WebSocket routes.
    pub websocket: WebSocketConfig,
}

/// Defaults applied to WebSocket routes registered without explicit options.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebSocketConfig {
    pub max_payload: usize,
    pub max_backpressure: usize,
    pub idle_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 10,
            max_head_size: 16 * 1024,
            max_body_size: 16 * 1024 * 1024,
            websocket: WebSocketConfig::default(),
        }
    }
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        let options = WsOptions::default();
        Self {
            max_payload: options.max_payload,
            max_backpressure: options.max_backpressure,
            idle_timeout_secs: options.idle_timeout.as_secs(),
        }
    }
}

impl WebSocketConfig {
    /// Route options carrying these defaults.
    pub fn options(&self) -> WsOptions {
        WsOptions {
            max_payload: self.max_payload,
            max_backpressure: self.max_backpressure,
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            protocols: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Parses and validates TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.idle_timeout_secs == 0 {
            return Err(ConfigError::Invalid("idle_timeout_secs must be positive".into()));
        }
        if self.max_head_size < 256 {
            return Err(ConfigError::Invalid("max_head_size must be at least 256 bytes".into()));
        }
        if self.websocket.max_payload == 0 {
            return Err(ConfigError::Invalid("websocket.max_payload must be positive".into()));
        }
        if self.websocket.idle_timeout_secs == 0 {
            return Err(ConfigError::Invalid("websocket.idle_timeout_secs must be positive".into()));
        }
        Ok(())
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout_secs = timeout.as_secs().max(1);
        self
    }

    pub fn with_max_head_size(mut self, bytes: usize) -> Self {
        self.max_head_size = bytes;
        self
    }

    pub fn with_max_body_size(mut self, bytes: usize) -> Self {
        self.max_body_size = bytes;
        self
    }

    pub fn with_websocket(mut self, websocket: WebSocketConfig) -> Self {
        self.websocket = websocket;
        self
    }
}
