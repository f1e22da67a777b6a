//! Downstream client state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;

/// Outbound frame queue depth per client.
pub const CLIENT_QUEUE_CAPACITY: usize = 256;

/// A connected downstream debugger client.
///
/// The fabric writes the outbound queue (fan-out path only); the client's
/// writer pump in the server crate drains it. Nothing else touches either
/// end.
pub struct ClientHandle {
    /// Unique id, generated at attach.
    pub id: String,
    /// Outbound frame queue; `None` once the queue has been closed.
    tx: Mutex<Option<mpsc::Sender<String>>>,
    /// Free-form attach metadata (user agent, remote address, query params).
    pub metadata: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    connected: AtomicBool,
    dropped_frames: AtomicU64,
}

/// Outcome of a non-blocking enqueue onto a client's queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// The queue is full; the frame was dropped for this client only.
    Full,
    /// The queue has been closed.
    Closed,
}

impl ClientHandle {
    pub fn new(id: String, tx: mpsc::Sender<String>, metadata: HashMap<String, String>) -> Self {
        Self {
            id,
            tx: Mutex::new(Some(tx)),
            metadata,
            created_at: Utc::now(),
            connected: AtomicBool::new(true),
            dropped_frames: AtomicU64::new(0),
        }
    }

    /// Non-blocking enqueue. A full queue increments the drop counter.
    pub fn send(&self, frame: String) -> SendOutcome {
        let guard = self.tx.lock();
        let Some(tx) = guard.as_ref() else {
            return SendOutcome::Closed;
        };
        match tx.try_send(frame) {
            Ok(()) => SendOutcome::Sent,
            Err(mpsc::error::TrySendError::Full(_)) => {
                let _ = self.dropped_frames.fetch_add(1, Ordering::Relaxed);
                SendOutcome::Full
            }
            Err(mpsc::error::TrySendError::Closed(_)) => SendOutcome::Closed,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Flip the connected flag. Returns `true` on the first call only, so the
    /// disconnect event fires exactly once.
    pub fn mark_disconnected(&self) -> bool {
        self.connected.swap(false, Ordering::AcqRel)
    }

    /// Close the outbound queue, terminating the client's writer pump.
    pub fn close_queue(&self) {
        let _ = self.tx.lock().take();
    }

    /// Total frames dropped against this client's full queue.
    pub fn drop_count(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }

    /// Read-only projection for the status surface.
    pub fn info(&self) -> ClientInfo {
        ClientInfo {
            id: self.id.clone(),
            connected: self.is_connected(),
            metadata: self.metadata.clone(),
            created_at: self.created_at,
        }
    }
}

/// What the status surface exposes about a client — never the socket or the
/// queue.
#[derive(Debug, Clone, Serialize)]
pub struct ClientInfo {
    pub id: String,
    pub connected: bool,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
}
