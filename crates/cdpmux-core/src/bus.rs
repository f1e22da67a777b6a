//! Fire-and-forget event dispatch.
//!
//! Each handler runs on its own task per event, so a slow subscriber cannot
//! stall dispatch or its peers. No ordering is guaranteed across handlers, or
//! across events for the same handler.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::events::{EventKind, ProxyEvent};

type Handler = Arc<dyn Fn(ProxyEvent) + Send + Sync>;

/// Topic-to-subscriber dispatcher with a wildcard topic.
#[derive(Default)]
pub struct EventBus {
    by_kind: RwLock<HashMap<EventKind, Vec<Handler>>>,
    /// Wildcard subscribers, invoked for every event. Used for audit logging.
    any: RwLock<Vec<Handler>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe a handler to one event kind.
    pub fn register<F>(&self, kind: EventKind, handler: F)
    where
        F: Fn(ProxyEvent) + Send + Sync + 'static,
    {
        self.by_kind
            .write()
            .entry(kind)
            .or_default()
            .push(Arc::new(handler));
    }

    /// Subscribe a handler to every event kind.
    pub fn register_any<F>(&self, handler: F)
    where
        F: Fn(ProxyEvent) + Send + Sync + 'static,
    {
        self.any.write().push(Arc::new(handler));
    }

    /// Deliver an event to kind subscribers and wildcard subscribers.
    ///
    /// Must be called from within a tokio runtime; each handler is spawned on
    /// its own task. A panicking handler takes down only that task.
    pub fn dispatch(&self, event: ProxyEvent) {
        let mut handlers: Vec<Handler> = Vec::new();
        if let Some(typed) = self.by_kind.read().get(&event.kind) {
            handlers.extend(typed.iter().cloned());
        }
        handlers.extend(self.any.read().iter().cloned());

        for handler in handlers {
            let ev = event.clone();
            drop(tokio::spawn(async move { handler(ev) }));
        }
    }

    /// Number of subscribers that would see an event of `kind`.
    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        let typed = self.by_kind.read().get(&kind).map_or(0, Vec::len);
        typed + self.any.read().len()
    }
}
