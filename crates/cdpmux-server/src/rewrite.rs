//! Discovery document rewriting.
//!
//! The browser advertises WebSocket URLs under its own host and port. Every
//! JSON discovery response passing through the proxy has those URLs rewritten
//! to the externally visible scheme and host, so a debugger client following
//! them lands back on the proxy.

use serde_json::{Map, Value};
use tracing::debug;
use url::Url;

/// Extract the port of a `host[:port]` authority; empty when absent or
/// malformed.
pub fn port_of(host_port: &str) -> &str {
    match host_port.rsplit_once(':') {
        Some((host, port))
            if !host.contains(':') && !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) =>
        {
            port
        }
        _ => "",
    }
}

/// The WebSocket scheme matching an external HTTP scheme.
pub fn ws_scheme_for(ext_scheme: &str) -> &'static str {
    if ext_scheme.eq_ignore_ascii_case("https") || ext_scheme.eq_ignore_ascii_case("wss") {
        "wss"
    } else {
        "ws"
    }
}

/// Rewrite a discovery body in place.
///
/// Objects are rewritten directly, arrays element-wise (object elements
/// only), any other JSON shape passes through unchanged. `None` signals a
/// rewrite failure; the caller falls back to the original bytes.
pub fn rewrite_discovery_body(body: &[u8], ext_scheme: &str, ext_host: &str) -> Option<Vec<u8>> {
    let mut value: Value = serde_json::from_slice(body).ok()?;

    match &mut value {
        Value::Object(obj) => rewrite_target(obj, ext_scheme, ext_host),
        Value::Array(items) => {
            for item in items {
                if let Value::Object(obj) = item {
                    rewrite_target(obj, ext_scheme, ext_host);
                }
            }
        }
        _ => return Some(body.to_vec()),
    }

    serde_json::to_vec(&value).ok()
}

/// Rewrite one target object's advertised URLs.
fn rewrite_target(obj: &mut Map<String, Value>, ext_scheme: &str, ext_host: &str) {
    let mut ws_path = String::new();

    if let Some(raw) = obj.get("webSocketDebuggerUrl").and_then(Value::as_str) {
        if !raw.is_empty() {
            if let Ok(parsed) = Url::parse(raw) {
                ws_path = parsed.path().to_string();
                if let Some(query) = parsed.query() {
                    ws_path.push('?');
                    ws_path.push_str(query);
                }
            }
        }
    }

    if ws_path.is_empty() {
        if let Some(id) = obj.get("id").and_then(Value::as_str) {
            if !id.is_empty() && obj.get("type").and_then(Value::as_str) == Some("page") {
                ws_path = format!("/devtools/page/{id}");
            }
        }
    }

    if ws_path.is_empty() {
        return;
    }

    let ws_url = format!("{}://{ext_host}{ws_path}", ws_scheme_for(ext_scheme));
    debug!(ws_url = %ws_url, "rewrote target URL");

    let _ = obj.insert("webSocketDebuggerUrl".into(), Value::String(ws_url.clone()));
    let _ = obj.insert("devtoolsFrontendUrl".into(), Value::String(ws_url.clone()));
    if obj.contains_key("devtoolsFrontendUrlCompat") {
        let _ = obj.insert("devtoolsFrontendUrlCompat".into(), Value::String(ws_url));
    }
}
