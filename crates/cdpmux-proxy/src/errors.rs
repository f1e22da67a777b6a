//! Fabric error types.

use thiserror::Error;

/// Errors surfaced by the proxy fabric.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Admission denied: the single debugging session is already held.
    #[error("session already locked by another client")]
    SessionLocked,

    /// No client registered under the given id.
    #[error("client {client_id} not found")]
    ClientNotFound {
        /// The missing client id.
        client_id: String,
    },

    /// The client's outbound queue is full.
    #[error("client {client_id} send queue is full")]
    QueueFull {
        /// The backed-up client.
        client_id: String,
    },

    /// The `/json/version` probe failed.
    #[error("browser discovery failed: {0}")]
    Discovery(String),

    /// The WebSocket dial to the resolved URL failed.
    #[error("browser dial failed: {0}")]
    Dial(String),

    /// The fabric is shutting down.
    #[error("proxy is shutting down")]
    ShuttingDown,
}
