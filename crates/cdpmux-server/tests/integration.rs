//! End-to-end tests: a fake browser behind the real proxy, driven by real
//! WebSocket clients.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as AxMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;

use cdpmux_core::bus::EventBus;
use cdpmux_core::events::EventKind;
use cdpmux_proxy::{CdpProxy, ClientManager, ConnectionManager};
use cdpmux_server::{Config, ProxyServer};

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<TcpStream>>;

const POLL_INTERVAL: Duration = Duration::from_millis(25);
const POLL_ATTEMPTS: u32 = 200;

// ─── Fake browser ────────────────────────────────────────────────────────────

#[derive(Clone)]
struct BrowserState {
    received: Arc<parking_lot::Mutex<Vec<String>>>,
    emit_tx: broadcast::Sender<String>,
    kick_tx: broadcast::Sender<()>,
}

/// A stand-in Chromium debugging endpoint: `/json/version`, `/json`, a
/// non-JSON page, and one `/devtools/browser/{id}` WebSocket.
struct FakeBrowser {
    addr: SocketAddr,
    received: Arc<parking_lot::Mutex<Vec<String>>>,
    emit_tx: broadcast::Sender<String>,
    kick_tx: broadcast::Sender<()>,
}

impl FakeBrowser {
    async fn spawn() -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let received = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let (emit_tx, _) = broadcast::channel(64);
        let (kick_tx, _) = broadcast::channel(4);

        let state = BrowserState {
            received: received.clone(),
            emit_tx: emit_tx.clone(),
            kick_tx: kick_tx.clone(),
        };

        let app = Router::new()
            .route("/json/version", get(version_handler))
            .route("/json", get(list_handler))
            .route("/json/protocol", get(protocol_handler))
            .route("/devtools/browser/{id}", get(browser_ws_handler))
            .with_state(state);

        drop(tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        }));

        Self {
            addr,
            received,
            emit_tx,
            kick_tx,
        }
    }

    fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Emit a frame toward whichever proxy connection is attached.
    fn push_frame(&self, frame: &str) {
        let _ = self.emit_tx.send(frame.to_string());
    }

    /// Abruptly drop the current debugging connection.
    fn kick(&self) {
        let _ = self.kick_tx.send(());
    }

    fn received(&self) -> Vec<String> {
        self.received.lock().clone()
    }
}

async fn version_handler(State(_state): State<BrowserState>) -> impl IntoResponse {
    // Advertise an internal hostname the proxy cannot reach; the connector
    // must substitute the configured host.
    axum::Json(json!({
        "Browser": "HeadlessChrome/131.0.6778.85",
        "User-Agent": "Mozilla/5.0 (X11; Linux x86_64) HeadlessChrome/131.0",
        "webSocketDebuggerUrl": "ws://chrome-internal:61000/devtools/browser/test"
    }))
}

async fn list_handler(State(_state): State<BrowserState>) -> impl IntoResponse {
    axum::Json(json!([{
        "id": "ABC",
        "type": "page",
        "title": "Example",
        "url": "https://example.com/",
        "webSocketDebuggerUrl": "ws://localhost:61000/devtools/page/ABC"
    }]))
}

async fn protocol_handler() -> impl IntoResponse {
    (
        [(axum::http::header::CONTENT_TYPE, "text/html")],
        "<html>contains :61000 port</html>",
    )
}

async fn browser_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<BrowserState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| run_browser_socket(socket, state))
}

async fn run_browser_socket(socket: WebSocket, state: BrowserState) {
    let (mut tx, mut rx) = socket.split();
    let mut emit = state.emit_tx.subscribe();
    let mut kick = state.kick_tx.subscribe();

    loop {
        tokio::select! {
            frame = emit.recv() => {
                let Ok(frame) = frame else { break };
                if tx.send(AxMessage::Text(frame.into())).await.is_err() {
                    break;
                }
            }
            _ = kick.recv() => break,
            item = rx.next() => match item {
                Some(Ok(AxMessage::Text(text))) => state.received.lock().push(text.to_string()),
                Some(Ok(_)) => {}
                _ => break,
            }
        }
    }
}

// ─── Harness ─────────────────────────────────────────────────────────────────

struct TestProxy {
    addr: SocketAddr,
    proxy: Arc<CdpProxy>,
    server: ProxyServer,
    bus: Arc<EventBus>,
}

async fn boot_proxy(browser_url: &str) -> TestProxy {
    let config = Config {
        port: 0,
        browser_url: browser_url.to_string(),
        connection_timeout_seconds: 2,
        ..Config::default()
    };

    let bus = Arc::new(EventBus::new());
    let proxy = CdpProxy::new(config.proxy_config(), bus.clone());
    let _pumps = proxy.start();

    let metrics_handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .build_recorder()
        .handle();
    let server = ProxyServer::new(config, proxy.clone(), metrics_handle);
    let (addr, _handle) = server.listen().await.unwrap();

    TestProxy {
        addr,
        proxy,
        server,
        bus,
    }
}

async fn wait_connected(proxy: &Arc<CdpProxy>) -> bool {
    for _ in 0..POLL_ATTEMPTS {
        if proxy.is_connected().await {
            return true;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
    false
}

async fn wait_client_count(proxy: &Arc<CdpProxy>, expected: usize) -> bool {
    for _ in 0..POLL_ATTEMPTS {
        if proxy.client_count().await == expected {
            return true;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
    false
}

async fn wait_received(browser: &FakeBrowser, expected: usize) -> bool {
    for _ in 0..POLL_ATTEMPTS {
        if browser.received().len() >= expected {
            return true;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
    false
}

async fn connect_client(addr: SocketAddr, path: &str) -> WsStream {
    let (ws, _) = connect_async(format!("ws://{addr}/devtools/{path}"))
        .await
        .unwrap();
    ws
}

/// Next text frame from a client socket, skipping pings/pongs.
async fn next_text(ws: &mut WsStream) -> Option<String> {
    loop {
        let item = timeout(Duration::from_secs(3), ws.next()).await.ok()??;
        match item.ok()? {
            Message::Text(text) => return Some(text.to_string()),
            Message::Ping(_) | Message::Pong(_) => {}
            _ => return None,
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn connector_resolves_and_dials_browser() {
    let browser = FakeBrowser::spawn().await;
    let t = boot_proxy(&browser.base_url()).await;

    assert!(wait_connected(&t.proxy).await, "proxy never connected");
    let info = t.proxy.browser_info().await.unwrap();
    // The advertised chrome-internal host must have been replaced.
    assert!(info.url.contains(&browser.addr.to_string()), "got {}", info.url);
    assert!(info.url.ends_with("/devtools/browser/test"));
    assert_eq!(info.version, "HeadlessChrome/131.0.6778.85");
}

#[tokio::test]
async fn discovery_list_rewritten_to_proxy_host() {
    let browser = FakeBrowser::spawn().await;
    let t = boot_proxy(&browser.base_url()).await;

    let body: Value = reqwest::get(format!("http://{}/json", t.addr))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    let expected = format!("ws://{}/devtools/page/ABC", t.addr);
    assert_eq!(body[0]["webSocketDebuggerUrl"], expected.as_str());
    assert_eq!(body[0]["devtoolsFrontendUrl"], expected.as_str());
    assert_eq!(body[0]["title"], "Example");
    assert!(!serde_json::to_string(&body).unwrap().contains(":61000"));
}

#[tokio::test]
async fn forwarded_headers_pick_external_address() {
    let browser = FakeBrowser::spawn().await;
    let t = boot_proxy(&browser.base_url()).await;

    let client = reqwest::Client::new();
    let body: Value = client
        .get(format!("http://{}/json", t.addr))
        .header("X-Forwarded-Host", "public.example:443")
        .header("X-Forwarded-Proto", "https")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(
        body[0]["webSocketDebuggerUrl"],
        "wss://public.example:443/devtools/page/ABC"
    );
}

#[tokio::test]
async fn non_json_discovery_passes_through_verbatim() {
    let browser = FakeBrowser::spawn().await;
    let t = boot_proxy(&browser.base_url()).await;

    let resp = reqwest::get(format!("http://{}/json/protocol", t.addr))
        .await
        .unwrap();
    let body = resp.text().await.unwrap();
    assert_eq!(body, "<html>contains :61000 port</html>");
}

#[tokio::test]
async fn client_commands_reach_browser_in_order() {
    let browser = FakeBrowser::spawn().await;
    let t = boot_proxy(&browser.base_url()).await;
    assert!(wait_connected(&t.proxy).await);

    let mut client = connect_client(t.addr, "page/ABC").await;
    for i in 1..=3 {
        client
            .send(Message::text(format!(r#"{{"id":{i},"method":"Page.enable"}}"#)))
            .await
            .unwrap();
    }

    assert!(wait_received(&browser, 3).await, "browser saw {:?}", browser.received());
    let received = browser.received();
    for (i, frame) in received.iter().take(3).enumerate() {
        assert!(frame.contains(&format!(r#""id":{}"#, i + 1)), "frame {i}: {frame}");
    }
}

#[tokio::test]
async fn browser_frames_fan_out_in_order() {
    let browser = FakeBrowser::spawn().await;
    let t = boot_proxy(&browser.base_url()).await;
    assert!(wait_connected(&t.proxy).await);

    let mut client = connect_client(t.addr, "browser").await;
    assert!(wait_client_count(&t.proxy, 1).await);

    for i in 0..20 {
        browser.push_frame(&format!(
            r#"{{"method":"Network.requestWillBeSent","params":{{"seq":{i}}}}}"#
        ));
    }

    for i in 0..20 {
        let frame = next_text(&mut client).await.expect("missing frame");
        assert!(frame.contains(&format!(r#""seq":{i}"#)), "frame {i}: {frame}");
    }
}

#[tokio::test]
async fn second_client_rejected_with_policy_close() {
    let browser = FakeBrowser::spawn().await;
    let t = boot_proxy(&browser.base_url()).await;
    assert!(wait_connected(&t.proxy).await);

    let client_a = connect_client(t.addr, "page/ABC").await;
    assert!(wait_client_count(&t.proxy, 1).await);

    let mut client_b = connect_client(t.addr, "page/ABC").await;
    let rejection = timeout(Duration::from_secs(3), client_b.next())
        .await
        .expect("no close frame")
        .expect("stream ended")
        .expect("read error");

    match rejection {
        Message::Close(Some(frame)) => {
            assert_eq!(frame.code, CloseCode::Policy);
            assert!(
                frame.reason.contains("session already locked"),
                "reason: {}",
                frame.reason
            );
        }
        other => panic!("expected close frame, got {other:?}"),
    }
    assert_eq!(t.proxy.client_count().await, 1);

    // Once the holder leaves, a new client attaches cleanly.
    drop(client_a);
    assert!(wait_client_count(&t.proxy, 0).await);
    let _client_c = connect_client(t.addr, "page/ABC").await;
    assert!(wait_client_count(&t.proxy, 1).await);
}

#[tokio::test]
async fn lifecycle_events_fire_once_per_client() {
    let browser = FakeBrowser::spawn().await;
    let t = boot_proxy(&browser.base_url()).await;
    assert!(wait_connected(&t.proxy).await);

    let (connected_tx, mut connected_rx) = tokio::sync::mpsc::unbounded_channel();
    let (disconnected_tx, mut disconnected_rx) = tokio::sync::mpsc::unbounded_channel();
    t.bus.register(EventKind::ClientConnected, move |ev| {
        let _ = connected_tx.send(ev);
    });
    t.bus.register(EventKind::ClientDisconnected, move |ev| {
        let _ = disconnected_tx.send(ev);
    });

    let client = connect_client(t.addr, "page/ABC?session=s1").await;
    let connected = timeout(Duration::from_secs(3), connected_rx.recv())
        .await
        .unwrap()
        .unwrap();
    let params = connected.params.unwrap();
    assert_eq!(params["metadata"]["target_id"], "ABC");
    assert_eq!(params["metadata"]["session"], "s1");

    drop(client);
    let disconnected = timeout(Duration::from_secs(3), disconnected_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(disconnected.kind, EventKind::ClientDisconnected);

    // Exactly once: no further lifecycle events arrive.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(connected_rx.try_recv().is_err());
    assert!(disconnected_rx.try_recv().is_err());
}

#[tokio::test]
async fn status_api_reflects_fabric_state() {
    let browser = FakeBrowser::spawn().await;
    let t = boot_proxy(&browser.base_url()).await;
    assert!(wait_connected(&t.proxy).await);

    let _client = connect_client(t.addr, "page/ABC?flavor=test").await;
    assert!(wait_client_count(&t.proxy, 1).await);

    let body: Value = reqwest::get(format!("http://{}/api/browser", t.addr))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], true);
    assert_eq!(body["clients"], 1);
    assert_eq!(body["browser"]["version"], "HeadlessChrome/131.0.6778.85");

    let body: Value = reqwest::get(format!("http://{}/api/clients", t.addr))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["count"], 1);
    assert_eq!(body["clients"][0]["metadata"]["target_id"], "ABC");
    assert_eq!(body["clients"][0]["metadata"]["flavor"], "test");
    assert_eq!(body["clients"][0]["metadata"]["path"], "page/ABC");
}

#[tokio::test]
async fn health_endpoint_is_plain_ok() {
    let browser = FakeBrowser::spawn().await;
    let t = boot_proxy(&browser.base_url()).await;

    let resp = reqwest::get(format!("http://{}/health", t.addr)).await.unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    assert_eq!(resp.text().await.unwrap(), "OK");
}

#[tokio::test]
async fn clients_survive_upstream_reconnect() {
    let browser = FakeBrowser::spawn().await;
    let t = boot_proxy(&browser.base_url()).await;
    assert!(wait_connected(&t.proxy).await);

    let mut client = connect_client(t.addr, "browser").await;
    assert!(wait_client_count(&t.proxy, 1).await);

    browser.kick();
    // The connector re-establishes without touching the client.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(wait_connected(&t.proxy).await, "proxy never reconnected");
    assert_eq!(t.proxy.client_count().await, 1);

    // Frames flow again after the gap. The push races the fake browser's
    // fresh subscription, so retry until one lands.
    let marker = r#"{"method":"Target.targetCreated","params":{"after":"reconnect"}}"#;
    let mut delivered = None;
    for _ in 0..20 {
        browser.push_frame(marker);
        let received = tokio::select! {
            text = next_text(&mut client) => text,
            () = tokio::time::sleep(Duration::from_millis(300)) => None,
        };
        if received.is_some() {
            delivered = received;
            break;
        }
    }
    let frame = delivered.expect("no frame after reconnect");
    assert!(frame.contains("reconnect"));
}

#[tokio::test]
async fn clients_attach_while_browser_absent() {
    // No browser behind this address.
    let t = boot_proxy("http://127.0.0.1:1").await;

    let mut client = connect_client(t.addr, "page/ABC").await;
    assert!(wait_client_count(&t.proxy, 1).await);
    assert!(!t.proxy.is_connected().await);

    // Commands toward the absent browser are dropped, not fatal.
    client
        .send(Message::text(r#"{"id":1,"method":"Page.enable"}"#))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(t.proxy.client_count().await, 1);

    // /api/browser surfaces the discovery failure; the registry is unaffected.
    let resp = reqwest::get(format!("http://{}/api/browser", t.addr))
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 500);
    assert_eq!(t.proxy.client_count().await, 1);
}

#[tokio::test]
async fn graceful_shutdown_clears_everything() {
    let browser = FakeBrowser::spawn().await;
    let t = boot_proxy(&browser.base_url()).await;
    assert!(wait_connected(&t.proxy).await);

    let mut client = connect_client(t.addr, "browser").await;
    assert!(wait_client_count(&t.proxy, 1).await);

    t.proxy.shutdown().await;
    t.server.shutdown_coordinator().shutdown();

    assert_eq!(t.proxy.client_count().await, 0);
    assert!(!t.proxy.is_connected().await);

    // The client's socket winds down within the grace window.
    let end = timeout(Duration::from_secs(1), async {
        loop {
            match client.next().await {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break,
                Some(Ok(_)) => {}
            }
        }
    })
    .await;
    assert!(end.is_ok(), "client socket still open after shutdown");
}

#[tokio::test]
async fn new_attach_rejected_after_shutdown() {
    let browser = FakeBrowser::spawn().await;
    let t = boot_proxy(&browser.base_url()).await;
    assert!(wait_connected(&t.proxy).await);

    t.proxy.shutdown().await;

    let err = t
        .proxy
        .add_client(std::collections::HashMap::new())
        .await
        .unwrap_err();
    assert!(matches!(err, cdpmux_proxy::ProxyError::ShuttingDown));
}
