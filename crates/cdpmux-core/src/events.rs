//! Proxy event model.
//!
//! A closed sum of event kinds rather than free-form topic strings, so a
//! typo'd subscription is a compile error instead of a silent no-op.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The kinds of events the proxy emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// A client sent a CDP command toward the browser.
    #[serde(rename = "cdp.command")]
    CdpCommand,
    /// The browser emitted a CDP event.
    #[serde(rename = "cdp.event")]
    CdpEvent,
    /// A client attached.
    #[serde(rename = "client.connected")]
    ClientConnected,
    /// A client detached.
    #[serde(rename = "client.disconnected")]
    ClientDisconnected,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::CdpCommand => "cdp.command",
            EventKind::CdpEvent => "cdp.event",
            EventKind::ClientConnected => "client.connected",
            EventKind::ClientDisconnected => "client.disconnected",
        }
    }
}

/// Which side of the fabric produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Client,
    Browser,
}

/// An observation or lifecycle event. Subscribers receive events by value.
#[derive(Debug, Clone, Serialize)]
pub struct ProxyEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// CDP method copied from the triggering frame, when there was one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// CDP params or lifecycle payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Map<String, Value>>,
    #[serde(rename = "source_type")]
    pub source: SourceKind,
    #[serde(rename = "source_id", skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ProxyEvent {
    /// A client-originated CDP command observation.
    pub fn cdp_command(
        method: String,
        params: Option<Map<String, Value>>,
        client_id: &str,
    ) -> Self {
        Self {
            kind: EventKind::CdpCommand,
            method: Some(method),
            params,
            source: SourceKind::Client,
            source_id: Some(client_id.to_string()),
            timestamp: Utc::now(),
        }
    }

    /// A browser-originated CDP event observation.
    pub fn cdp_event(method: String, params: Option<Map<String, Value>>) -> Self {
        Self {
            kind: EventKind::CdpEvent,
            method: Some(method),
            params,
            source: SourceKind::Browser,
            source_id: None,
            timestamp: Utc::now(),
        }
    }

    /// A client attached; `metadata` is carried in the params.
    pub fn client_connected(client_id: &str, metadata: &std::collections::HashMap<String, String>) -> Self {
        let mut params = Map::new();
        params.insert("client_id".into(), Value::String(client_id.to_string()));
        params.insert(
            "metadata".into(),
            serde_json::to_value(metadata).unwrap_or(Value::Null),
        );
        Self {
            kind: EventKind::ClientConnected,
            method: None,
            params: Some(params),
            source: SourceKind::Client,
            source_id: Some(client_id.to_string()),
            timestamp: Utc::now(),
        }
    }

    /// A client detached.
    pub fn client_disconnected(client_id: &str) -> Self {
        let mut params = Map::new();
        params.insert("client_id".into(), Value::String(client_id.to_string()));
        Self {
            kind: EventKind::ClientDisconnected,
            method: None,
            params: Some(params),
            source: SourceKind::Client,
            source_id: Some(client_id.to_string()),
            timestamp: Utc::now(),
        }
    }
}
