//! `ProxyServer` — axum HTTP + WebSocket surface.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, OriginalUri, Path, RawQuery, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::request_id::{
    MakeRequestId, PropagateRequestIdLayer, RequestId, SetRequestIdLayer,
};
use tower_http::timeout::TimeoutLayer;
use tracing::{info, instrument};

use crate::config::Config;
use crate::proxy_http::DiscoveryProxy;
use crate::shutdown::ShutdownCoordinator;
use crate::ws::{extract_client_metadata, run_client_session};
use cdpmux_proxy::{ClientManager, ConnectionManager, ProxyApi};

/// Generates UUIDv7 request ids.
#[derive(Clone)]
struct UuidV7RequestId;

impl MakeRequestId for UuidV7RequestId {
    fn make_request_id<B>(&mut self, _request: &axum::http::Request<B>) -> Option<RequestId> {
        let id = uuid::Uuid::now_v7().to_string();
        axum::http::HeaderValue::from_str(&id).ok().map(RequestId::new)
    }
}

/// Shared state accessible from handlers.
#[derive(Clone)]
pub struct AppState {
    pub proxy: Arc<dyn ProxyApi>,
    pub discovery: Arc<DiscoveryProxy>,
    pub shutdown: Arc<ShutdownCoordinator>,
    pub config: Config,
    pub metrics_handle: Arc<PrometheusHandle>,
}

/// The downstream-facing server in front of one browser.
pub struct ProxyServer {
    config: Config,
    proxy: Arc<dyn ProxyApi>,
    discovery: Arc<DiscoveryProxy>,
    shutdown: Arc<ShutdownCoordinator>,
    metrics_handle: Arc<PrometheusHandle>,
}

impl ProxyServer {
    pub fn new(config: Config, proxy: Arc<dyn ProxyApi>, metrics_handle: PrometheusHandle) -> Self {
        let discovery = Arc::new(DiscoveryProxy::new(&config.browser_url));
        Self {
            config,
            proxy,
            discovery,
            shutdown: Arc::new(ShutdownCoordinator::new()),
            metrics_handle: Arc::new(metrics_handle),
        }
    }

    /// Build the router with all routes and middleware.
    pub fn router(&self) -> Router {
        let state = AppState {
            proxy: self.proxy.clone(),
            discovery: self.discovery.clone(),
            shutdown: self.shutdown.clone(),
            config: self.config.clone(),
            metrics_handle: self.metrics_handle.clone(),
        };

        Router::new()
            .route("/json", get(discovery_handler))
            .route("/json/{*rest}", get(discovery_handler))
            .route("/devtools/{*path}", get(ws_upgrade_handler))
            .route("/api/browser", get(browser_info_handler))
            .route("/api/clients", get(clients_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(state)
            // Outermost layers run first on the request.
            .layer(CatchPanicLayer::new())
            .layer(RequestBodyLimitLayer::new(1024 * 1024))
            .layer(TimeoutLayer::new(Duration::from_secs(30)))
            .layer(SetRequestIdLayer::x_request_id(UuidV7RequestId))
            .layer(PropagateRequestIdLayer::x_request_id())
    }

    /// Bind and serve. Returns the bound address and the server task handle.
    #[instrument(skip_all, fields(port = self.config.port))]
    pub async fn listen(&self) -> Result<(SocketAddr, tokio::task::JoinHandle<()>), std::io::Error> {
        let addr = format!("0.0.0.0:{}", self.config.port);
        let listener = TcpListener::bind(&addr).await?;
        let bound_addr = listener.local_addr()?;

        info!(
            addr = %bound_addr,
            browser = %self.discovery.browser_base(),
            frontend = %self.config.frontend_url,
            "proxy server started"
        );

        let router = self.router();
        let shutdown_token = self.shutdown.token();

        let handle = tokio::spawn(async move {
            let _ = axum::serve(
                listener,
                router.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                shutdown_token.cancelled().await;
                info!("server shutdown initiated");
            })
            .await;
            info!("server shutdown complete");
        });

        Ok((bound_addr, handle))
    }

    pub fn shutdown_coordinator(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

/// GET /json and /json/{*rest} — reverse-proxied discovery with URL rewrite.
async fn discovery_handler(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
) -> Response {
    let ext_scheme = first_header(&headers, &["x-external-scheme", "x-forwarded-proto"])
        .unwrap_or_else(|| "http".to_string());
    let ext_host = first_header(&headers, &["x-external-host", "x-forwarded-host", "host"])
        .unwrap_or_default();

    let path_and_query = uri
        .path_and_query()
        .map_or("/json", |pq| pq.as_str());

    state
        .discovery
        .forward(path_and_query, &ext_scheme, &ext_host)
        .await
}

fn first_header(headers: &HeaderMap, names: &[&str]) -> Option<String> {
    names.iter().find_map(|name| {
        headers
            .get(*name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(ToString::to_string)
    })
}

/// GET /devtools/{*path} — upgrade and bind a new client.
async fn ws_upgrade_handler(
    ws: WebSocketUpgrade,
    Path(path): Path<String>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok());
    let metadata = extract_client_metadata(&path, query.as_deref(), user_agent, remote_addr);

    let proxy = state.proxy.clone();
    let shutdown = state.shutdown.token();

    ws.max_message_size(state.config.max_message_size)
        .on_upgrade(move |socket| run_client_session(socket, proxy, metadata, shutdown))
}

/// GET /api/browser
async fn browser_info_handler(State(state): State<AppState>) -> Response {
    match state.proxy.browser_info().await {
        Ok(info) => Json(json!({
            "browser": info,
            "clients": state.proxy.client_count().await,
            "status": state.proxy.is_connected().await,
        }))
        .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to get browser info: {e}"),
        )
            .into_response(),
    }
}

/// GET /api/clients
async fn clients_handler(State(state): State<AppState>) -> Response {
    let clients = state.proxy.clients().await;
    Json(json!({
        "count": clients.len(),
        "clients": clients,
    }))
    .into_response()
}

/// GET /health
async fn health_handler() -> &'static str {
    "OK"
}

/// GET /metrics — Prometheus text format.
async fn metrics_handler(State(state): State<AppState>) -> String {
    state.metrics_handle.render()
}
