//! Server configuration.
//!
//! Layering matches the deployment story: a JSON file named by `CONFIG_PATH`
//! wins wholesale, otherwise each field falls back from its environment
//! variable to its default. CLI flags are applied on top by the binary.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use cdpmux_proxy::ProxyConfig;

/// Errors from loading a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Proxy configuration. Immutable after startup.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// External listen port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Upstream browser base (`ws`/`wss`/`http`/`https`/`host[:port]`).
    #[serde(default = "default_browser_url")]
    pub browser_url: String,
    /// Externally visible base used when no forwarded headers are present.
    #[serde(default = "default_frontend_url")]
    pub frontend_url: String,
    /// Read limit in bytes per WebSocket.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    /// Upstream dial timeout in seconds.
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_seconds: u64,
}

fn default_port() -> u16 {
    8080
}

fn default_browser_url() -> String {
    "http://localhost:6100".into()
}

fn default_frontend_url() -> String {
    "http://localhost:80".into()
}

fn default_max_message_size() -> usize {
    1024 * 1024 // 1 MiB
}

fn default_connection_timeout() -> u64 {
    10
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            browser_url: default_browser_url(),
            frontend_url: default_frontend_url(),
            max_message_size: default_max_message_size(),
            connection_timeout_seconds: default_connection_timeout(),
        }
    }
}

impl Config {
    /// Load configuration: the file at `CONFIG_PATH` (or `path_override`)
    /// when present and parseable, otherwise environment variables over
    /// defaults.
    pub fn load(path_override: Option<&Path>) -> Self {
        let file_path = path_override
            .map(Path::to_path_buf)
            .or_else(|| std::env::var("CONFIG_PATH").ok().map(Into::into));

        if let Some(path) = file_path {
            match Self::from_file(&path) {
                Ok(config) => return config,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "config file unusable, falling back to environment");
                }
            }
        }

        Self::from_env()
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Per-field environment lookup; unparseable values fall back to the
    /// field default.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(port) = std::env::var("PORT") {
            if let Ok(port) = port.parse() {
                config.port = port;
            }
        }
        if let Ok(url) = std::env::var("BROWSER_URL") {
            if !url.is_empty() {
                config.browser_url = url;
            }
        }
        if let Ok(url) = std::env::var("FRONTEND_URL") {
            if !url.is_empty() {
                config.frontend_url = url;
            }
        }
        if let Ok(size) = std::env::var("MAX_MESSAGE_SIZE") {
            if let Ok(size) = size.parse() {
                config.max_message_size = size;
            }
        }
        if let Ok(timeout) = std::env::var("CONNECTION_TIMEOUT_SECONDS") {
            if let Ok(timeout) = timeout.parse() {
                config.connection_timeout_seconds = timeout;
            }
        }

        config
    }

    /// The slice of configuration the fabric consumes.
    pub fn proxy_config(&self) -> ProxyConfig {
        ProxyConfig {
            browser_url: self.browser_url.clone(),
            max_message_size: self.max_message_size,
            connection_timeout: Duration::from_secs(self.connection_timeout_seconds),
        }
    }
}
