//! Reverse proxy for the browser's HTTP discovery surface.
//!
//! Discovery responses are small and latency-bounded, so the upstream client
//! uses short per-stage timeouts and a warm per-host pool.

use std::time::Duration;

use axum::body::Body;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use tracing::{debug, warn};

use crate::rewrite::rewrite_discovery_body;
use cdpmux_proxy::discovery::normalize_browser_url;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(2);
const POOL_MAX_IDLE_PER_HOST: usize = 32;

/// Forwards `/json/*` requests to the browser and rewrites JSON bodies.
pub struct DiscoveryProxy {
    client: reqwest::Client,
    browser_base: String,
    internal_port: String,
}

impl DiscoveryProxy {
    pub fn new(browser_url: &str) -> Self {
        let browser_base = normalize_browser_url(browser_url);
        let internal_port = url::Url::parse(&browser_base)
            .ok()
            .and_then(|u| u.port().map(|p| p.to_string()))
            .unwrap_or_default();

        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(RESPONSE_TIMEOUT)
            .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            client,
            browser_base,
            internal_port,
        }
    }

    pub fn browser_base(&self) -> &str {
        &self.browser_base
    }

    /// The browser's own port, stripped from advertised URLs by the rewrite.
    pub fn internal_port(&self) -> &str {
        &self.internal_port
    }

    /// Forward one discovery request. JSON bodies come back rewritten to the
    /// external scheme/host; anything else passes through byte-for-byte.
    /// Upstream transport failures surface as `502 Bad Gateway`.
    pub async fn forward(
        &self,
        path_and_query: &str,
        ext_scheme: &str,
        ext_host: &str,
    ) -> Response {
        let target = format!("{}{}", self.browser_base, path_and_query);

        let resp = match self.client.get(&target).send().await {
            Ok(resp) => resp,
            Err(e) => {
                warn!(target = %target, error = %e, "discovery request failed");
                return (StatusCode::BAD_GATEWAY, "Bad Gateway").into_response();
            }
        };

        let status =
            StatusCode::from_u16(resp.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
        let content_type = resp
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();

        let body = match resp.bytes().await {
            Ok(body) => body,
            Err(e) => {
                warn!(target = %target, error = %e, "discovery body read failed");
                return (StatusCode::BAD_GATEWAY, "Bad Gateway").into_response();
            }
        };

        let body: Vec<u8> = if content_type.starts_with("application/json") {
            match rewrite_discovery_body(&body, ext_scheme, ext_host) {
                Some(rewritten) => {
                    debug!(
                        ext_host,
                        internal_port = %self.internal_port,
                        "rewrote discovery document"
                    );
                    rewritten
                }
                // Rewrite failure falls back to the browser's bytes.
                None => body.to_vec(),
            }
        } else {
            body.to_vec()
        };

        let mut builder = axum::http::Response::builder().status(status);
        if !content_type.is_empty() {
            builder = builder.header(header::CONTENT_TYPE, content_type);
        }
        builder
            .body(Body::from(body))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
    }
}
