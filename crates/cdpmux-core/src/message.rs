//! CDP frame codec — lenient parsing and classification.
//!
//! Frames are length-delimited UTF-8 JSON. A frame that fails to parse, or
//! whose shape matches no known kind, is still forwarded by the fabric; the
//! codec only exists to classify frames for observation events and filters.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A parsed DevTools Protocol frame.
///
/// All fields are optional on the wire; absent `id` reads as `0` and absent
/// `method` as the empty string, which is what the classification rules key
/// off.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CdpMessage {
    /// Command/response correlation id. `0` means absent.
    #[serde(default, skip_serializing_if = "id_is_absent")]
    pub id: i64,
    /// Domain-qualified method name, e.g. `Page.navigate`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub method: String,
    /// Method parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Map<String, Value>>,
    /// Response payload, kept opaque.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Response error payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<CdpError>,
}

fn id_is_absent(id: &i64) -> bool {
    *id == 0
}

/// The `error` object of a failed CDP response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CdpError {
    pub code: i64,
    pub message: String,
}

/// Frame classification. Kinds are mutually exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// `id != 0` and non-empty `method`.
    Command,
    /// `id == 0` and non-empty `method`.
    Event,
    /// `id != 0` and empty `method`.
    Response,
    /// Anything else; forwarded untouched.
    Other,
}

impl CdpMessage {
    /// Parse a frame. `None` means the frame is not JSON of the expected
    /// shape — never an error, the caller forwards it as-is.
    pub fn parse(data: &str) -> Option<Self> {
        serde_json::from_str(data).ok()
    }

    pub fn kind(&self) -> MessageKind {
        if self.id != 0 && !self.method.is_empty() {
            MessageKind::Command
        } else if self.id == 0 && !self.method.is_empty() {
            MessageKind::Event
        } else if self.id != 0 && self.method.is_empty() {
            MessageKind::Response
        } else {
            MessageKind::Other
        }
    }

    pub fn is_command(&self) -> bool {
        self.kind() == MessageKind::Command
    }

    pub fn is_event(&self) -> bool {
        self.kind() == MessageKind::Event
    }

    pub fn is_response(&self) -> bool {
        self.kind() == MessageKind::Response
    }
}

/// Whether a message matches a method pattern and a set of dotted-path
/// parameter equalities.
///
/// `method_pattern` of `*` matches any method. Each filter key is a
/// `.`-separated path into `params` (e.g. `request.url`) compared against the
/// expected value by deep equality. Used by observers, never by the fabric.
pub fn matches(
    msg: &CdpMessage,
    method_pattern: &str,
    param_filters: &Map<String, Value>,
) -> bool {
    if method_pattern != "*" && method_pattern != msg.method {
        return false;
    }

    if param_filters.is_empty() {
        return true;
    }

    let Some(params) = &msg.params else {
        return false;
    };

    for (path, expected) in param_filters {
        let mut current: &Value = &Value::Object(params.clone());
        for part in path.split('.') {
            match current.get(part) {
                Some(v) => current = v,
                None => return false,
            }
        }
        if current != expected {
            return false;
        }
    }

    true
}
