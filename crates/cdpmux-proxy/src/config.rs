//! Fabric configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration consumed by [`crate::CdpProxy`]. Immutable after startup.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Browser debugging endpoint (`ws`/`wss`/`http`/`https` or bare
    /// `host[:port]`).
    pub browser_url: String,
    /// Read limit in bytes applied to every WebSocket.
    pub max_message_size: usize,
    /// Upstream dial timeout.
    pub connection_timeout: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            browser_url: "http://localhost:9222".into(),
            max_message_size: 1024 * 1024, // 1 MiB
            connection_timeout: Duration::from_secs(10),
        }
    }
}
