//! Capability sets the fabric exposes.
//!
//! Kept small and orthogonal so a test double can stand in for the real
//! fabric: the server crate only ever talks to these traits.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::client::ClientInfo;
use crate::discovery::BrowserInfo;
use crate::errors::ProxyError;

/// Downstream client registry operations.
#[async_trait]
pub trait ClientManager: Send + Sync {
    /// Admit a client. Returns its fresh id and the receiving end of its
    /// outbound frame queue, or [`ProxyError::SessionLocked`] while another
    /// client holds the session.
    async fn add_client(
        &self,
        metadata: HashMap<String, String>,
    ) -> Result<(String, mpsc::Receiver<String>), ProxyError>;

    /// Remove a client; fails with [`ProxyError::ClientNotFound`] for an
    /// unknown id.
    async fn remove_client(&self, client_id: &str) -> Result<(), ProxyError>;

    async fn client_count(&self) -> usize;

    async fn clients(&self) -> Vec<ClientInfo>;
}

/// Upstream browser link queries.
#[async_trait]
pub trait ConnectionManager: Send + Sync {
    async fn is_connected(&self) -> bool;

    /// Re-fetch discovery and return the current browser details.
    async fn browser_info(&self) -> Result<BrowserInfo, ProxyError>;
}

/// Frame routing.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Forward a client frame toward the browser. Blocks while the
    /// upstream-outbound queue is full; aborted by shutdown.
    async fn handle_client_frame(&self, client_id: &str, frame: String) -> Result<(), ProxyError>;

    /// Enqueue a frame for one client without blocking. A full queue is
    /// reported as [`ProxyError::QueueFull`].
    async fn send_to_client(&self, client_id: &str, frame: String) -> Result<(), ProxyError>;
}

/// The full fabric surface the server depends on.
pub trait ProxyApi: ClientManager + ConnectionManager + MessageHandler {}

impl<T: ClientManager + ConnectionManager + MessageHandler> ProxyApi for T {}
