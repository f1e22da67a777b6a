//! Browser endpoint discovery.
//!
//! The configured browser URL may be a WebSocket URL, an HTTP base, or a bare
//! host. Discovery normalizes it to HTTP form, probes `/json/version`, and
//! rewrites the advertised WebSocket URL's host back to the configured one —
//! the browser usually advertises its own container-internal hostname, which
//! is not reachable from here.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use url::Url;

use crate::errors::ProxyError;

/// Deadline for the `/json/version` probe.
const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Resolved browser endpoint details, cached opportunistically.
#[derive(Debug, Clone, Serialize)]
pub struct BrowserInfo {
    /// The WebSocket URL to dial, with the reachable host substituted.
    pub url: String,
    /// Browser product string, e.g. `HeadlessChrome/131.0.6778.85`.
    pub version: String,
    pub user_agent: String,
    pub status: String,
    pub connection_time: DateTime<Utc>,
}

/// Convert a configured browser URL to its HTTP discovery base:
/// `ws:`→`http:`, `wss:`→`https:`, bare hosts get `http://`, any
/// `/devtools/…` suffix and trailing slash are stripped.
pub fn normalize_browser_url(raw: &str) -> String {
    let mut base = if let Some(rest) = raw.strip_prefix("ws:") {
        format!("http:{rest}")
    } else if let Some(rest) = raw.strip_prefix("wss:") {
        format!("https:{rest}")
    } else if raw.starts_with("http:") || raw.starts_with("https:") {
        raw.to_string()
    } else {
        format!("http://{raw}")
    };

    if let Some(idx) = base.rfind("/devtools/") {
        base.truncate(idx);
    }

    if base.ends_with('/') {
        base.pop();
    }

    base
}

/// Replace the host (and port) of `ws_url` with `authority` (`host[:port]`).
/// Returns the input unchanged when it cannot be parsed.
fn replace_host(ws_url: &str, authority: &str) -> String {
    let Ok(mut url) = Url::parse(ws_url) else {
        return ws_url.to_string();
    };
    if !url.has_host() || authority.is_empty() {
        return ws_url.to_string();
    }

    let (host, port) = match authority.rsplit_once(':') {
        Some((h, p)) if p.bytes().all(|b| b.is_ascii_digit()) && !p.is_empty() => {
            (h, p.parse::<u16>().ok())
        }
        _ => (authority, None),
    };

    if url.set_host(Some(host)).is_err() {
        return ws_url.to_string();
    }
    let _ = url.set_port(port);
    url.to_string()
}

/// Probe `<base>/json/version` and return the resolved [`BrowserInfo`].
///
/// Requires a non-empty `webSocketDebuggerUrl` in the response; its host is
/// rewritten to the host of the configured URL.
pub async fn fetch_browser_info(
    http: &reqwest::Client,
    browser_url: &str,
) -> Result<BrowserInfo, ProxyError> {
    let base = normalize_browser_url(browser_url);
    let configured_authority = Url::parse(&base)
        .ok()
        .and_then(|u| {
            u.host_str().map(|h| match u.port() {
                Some(p) => format!("{h}:{p}"),
                None => h.to_string(),
            })
        })
        .unwrap_or_default();

    let resp = http
        .get(format!("{base}/json/version"))
        .timeout(DISCOVERY_TIMEOUT)
        .send()
        .await
        .map_err(|e| ProxyError::Discovery(e.to_string()))?;

    if !resp.status().is_success() {
        return Err(ProxyError::Discovery(format!("HTTP {}", resp.status().as_u16())));
    }

    let body: Value = resp
        .json()
        .await
        .map_err(|e| ProxyError::Discovery(e.to_string()))?;

    let ws_url = body
        .get("webSocketDebuggerUrl")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ProxyError::Discovery("missing webSocketDebuggerUrl".into()))?;

    Ok(BrowserInfo {
        url: replace_host(ws_url, &configured_authority),
        version: body
            .get("Browser")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        user_agent: body
            .get("User-Agent")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        status: "connected".into(),
        connection_time: Utc::now(),
    })
}
