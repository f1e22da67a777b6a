//! The message fabric.
//!
//! One `CdpProxy` owns the single upstream browser socket and every client's
//! outbound queue. Browser frames fan out to all clients with a non-blocking
//! enqueue (a full queue drops that frame for that client only); client
//! frames funnel through one bounded queue drained by a single writer, which
//! gives the browser a total order of writes.
//!
//! The registry, the connected flag, and the upstream sink live behind one
//! readers-writer lock: fan-out and status queries take the read lock,
//! add/remove/swap take the write lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use metrics::counter;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use async_trait::async_trait;
use cdpmux_core::bus::EventBus;
use cdpmux_core::events::ProxyEvent;
use cdpmux_core::message::CdpMessage;

use crate::client::{ClientHandle, ClientInfo, SendOutcome, CLIENT_QUEUE_CAPACITY};
use crate::config::ProxyConfig;
use crate::discovery::{self, BrowserInfo};
use crate::errors::ProxyError;
use crate::traits::{ClientManager, ConnectionManager, MessageHandler};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type UpstreamSink = SplitSink<WsStream, Message>;
type UpstreamStream = SplitStream<WsStream>;

/// Depth of the single client→browser queue.
const UPSTREAM_QUEUE_CAPACITY: usize = 100;
/// Startup attempts at the short interval before switching to the long one.
const STARTUP_ATTEMPTS: u32 = 30;
const STARTUP_RETRY_DELAY: Duration = Duration::from_secs(2);
const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const UPSTREAM_WRITE_WAIT: Duration = Duration::from_secs(10);

/// State guarded by the fabric lock.
struct FabricState {
    clients: HashMap<String, Arc<ClientHandle>>,
    upstream: Option<UpstreamSink>,
    connected: bool,
}

/// The multiplexing fabric between one browser and its debugger clients.
pub struct CdpProxy {
    state: RwLock<FabricState>,
    upstream_tx: mpsc::Sender<String>,
    /// Taken by [`CdpProxy::start`] for the writer pump.
    upstream_rx: parking_lot::Mutex<Option<mpsc::Receiver<String>>>,
    bus: Arc<EventBus>,
    http: reqwest::Client,
    config: ProxyConfig,
    shutdown: CancellationToken,
}

impl CdpProxy {
    pub fn new(config: ProxyConfig, bus: Arc<EventBus>) -> Arc<Self> {
        let (upstream_tx, upstream_rx) = mpsc::channel(UPSTREAM_QUEUE_CAPACITY);
        Arc::new(Self {
            state: RwLock::new(FabricState {
                clients: HashMap::new(),
                upstream: None,
                connected: false,
            }),
            upstream_tx,
            upstream_rx: parking_lot::Mutex::new(Some(upstream_rx)),
            bus,
            http: reqwest::Client::new(),
            config,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Token cancelled when [`CdpProxy::shutdown`] runs.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Spawn the upstream read and write pumps. Returns their handles so the
    /// caller can await them during shutdown.
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut handles = vec![tokio::spawn(Arc::clone(self).run_upstream())];
        if let Some(rx) = self.upstream_rx.lock().take() {
            handles.push(tokio::spawn(Arc::clone(self).run_upstream_writer(rx)));
        }
        handles
    }

    /// Tear the fabric down: cancel every pump, close the upstream socket,
    /// close and drain every client.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();

        let mut st = self.state.write().await;
        if let Some(mut sink) = st.upstream.take() {
            let _ = sink.close().await;
        }
        st.connected = false;

        for (_, client) in st.clients.drain() {
            client.close_queue();
            if client.mark_disconnected() {
                self.bus.dispatch(ProxyEvent::client_disconnected(&client.id));
            }
        }
        drop(st);

        info!("cdp proxy shutdown complete");
    }

    // ─── Upstream link ───────────────────────────────────────────────────

    /// Discovery + dial. Swaps the stored sink under the write lock and
    /// returns the read half for the caller's pump.
    async fn establish(&self) -> Result<UpstreamStream, ProxyError> {
        let info = discovery::fetch_browser_info(&self.http, &self.config.browser_url).await?;

        let ws_config = WebSocketConfig::default()
            .max_message_size(Some(self.config.max_message_size))
            .max_frame_size(Some(self.config.max_message_size));

        let (ws, _) = tokio::time::timeout(
            self.config.connection_timeout,
            connect_async_with_config(info.url.as_str(), Some(ws_config), false),
        )
        .await
        .map_err(|_| {
            ProxyError::Dial(format!(
                "timed out after {}s",
                self.config.connection_timeout.as_secs()
            ))
        })?
        .map_err(|e| ProxyError::Dial(e.to_string()))?;

        let (sink, stream) = ws.split();

        let mut st = self.state.write().await;
        if let Some(mut old) = st.upstream.take() {
            let _ = old.close().await;
        }
        st.upstream = Some(sink);
        st.connected = true;
        drop(st);

        info!(url = %info.url, "connected to browser");
        Ok(stream)
    }

    async fn mark_upstream_lost(&self) {
        let mut st = self.state.write().await;
        if let Some(mut sink) = st.upstream.take() {
            let _ = sink.close().await;
        }
        st.connected = false;
    }

    /// Bounded-then-unbounded startup schedule: 30 attempts at 2 s, then
    /// indefinitely at 5 s. `None` means shutdown interrupted the loop.
    async fn connect_with_retry(&self) -> Option<UpstreamStream> {
        let mut attempt: u32 = 0;
        loop {
            if self.shutdown.is_cancelled() {
                return None;
            }
            attempt += 1;
            info!(
                url = %self.config.browser_url,
                attempt,
                "connecting to browser"
            );

            match self.establish().await {
                Ok(stream) => return Some(stream),
                Err(e) => warn!(error = %e, attempt, "browser connection failed"),
            }

            let delay = if attempt >= STARTUP_ATTEMPTS {
                if attempt == STARTUP_ATTEMPTS {
                    warn!(
                        attempts = STARTUP_ATTEMPTS,
                        "browser still unreachable, continuing to retry indefinitely"
                    );
                }
                RECONNECT_DELAY
            } else {
                STARTUP_RETRY_DELAY
            };

            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = self.shutdown.cancelled() => return None,
            }
        }
    }

    /// Reconnect after a mid-operation failure: single-shot attempts spaced
    /// by the reconnect delay until the link is back or shutdown fires.
    async fn reconnect_until(&self) -> Option<UpstreamStream> {
        self.mark_upstream_lost().await;

        loop {
            if self.shutdown.is_cancelled() {
                return None;
            }
            counter!("upstream_reconnects_total").increment(1);

            match self.establish().await {
                Ok(stream) => {
                    info!("reconnected to browser");
                    return Some(stream);
                }
                Err(e) => {
                    warn!(error = %e, "browser reconnect failed");
                    tokio::select! {
                        () = tokio::time::sleep(RECONNECT_DELAY) => {}
                        () = self.shutdown.cancelled() => return None,
                    }
                }
            }
        }
    }

    /// Upstream read pump: browser frames fan out to every client. Clients
    /// are never torn down on upstream loss.
    async fn run_upstream(self: Arc<Self>) {
        let Some(mut stream) = self.connect_with_retry().await else {
            return;
        };

        loop {
            let item = tokio::select! {
                item = stream.next() => item,
                () = self.shutdown.cancelled() => break,
            };

            match item {
                Some(Ok(Message::Text(text))) => self.fan_out(text.as_str()).await,
                Some(Ok(Message::Binary(data))) => {
                    if let Ok(text) = std::str::from_utf8(&data) {
                        self.fan_out(text).await;
                    }
                }
                // Ping/pong are answered by the protocol layer; a Close frame
                // is followed by stream end, handled below.
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(error = %e, "browser read failed");
                    match self.reconnect_until().await {
                        Some(s) => stream = s,
                        None => break,
                    }
                }
                None => {
                    warn!("browser connection closed");
                    match self.reconnect_until().await {
                        Some(s) => stream = s,
                        None => break,
                    }
                }
            }
        }
    }

    /// Upstream write pump: the single drain of the client→browser queue.
    /// A missing upstream drops the frame rather than buffering it.
    async fn run_upstream_writer(self: Arc<Self>, mut rx: mpsc::Receiver<String>) {
        loop {
            let frame = tokio::select! {
                maybe = rx.recv() => match maybe {
                    Some(frame) => frame,
                    None => break,
                },
                () = self.shutdown.cancelled() => break,
            };

            let mut st = self.state.write().await;
            if !st.connected {
                counter!("upstream_drops_total").increment(1);
                warn!("dropping client frame, browser not connected");
                continue;
            }
            let Some(sink) = st.upstream.as_mut() else {
                counter!("upstream_drops_total").increment(1);
                warn!("dropping client frame, browser not connected");
                continue;
            };

            match tokio::time::timeout(UPSTREAM_WRITE_WAIT, sink.send(Message::text(frame))).await
            {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(error = %e, "browser write failed");
                    st.connected = false;
                }
                Err(_) => {
                    warn!("browser write timed out");
                    st.connected = false;
                }
            }
        }
    }

    /// Deliver one browser frame to every attached client.
    async fn fan_out(&self, frame: &str) {
        if let Some(msg) = CdpMessage::parse(frame) {
            if msg.is_event() {
                self.bus
                    .dispatch(ProxyEvent::cdp_event(msg.method.clone(), msg.params.clone()));
            }
        }

        let st = self.state.read().await;
        for client in st.clients.values() {
            if !client.is_connected() {
                continue;
            }
            match client.send(frame.to_string()) {
                SendOutcome::Sent => {}
                SendOutcome::Full => {
                    counter!("fanout_drops_total").increment(1);
                    warn!(client_id = %client.id, "client queue full, dropping frame");
                }
                SendOutcome::Closed => {
                    debug!(client_id = %client.id, "client queue closed, skipping");
                }
            }
        }
    }
}

#[async_trait]
impl ClientManager for CdpProxy {
    async fn add_client(
        &self,
        metadata: HashMap<String, String>,
    ) -> Result<(String, mpsc::Receiver<String>), ProxyError> {
        if self.shutdown.is_cancelled() {
            return Err(ProxyError::ShuttingDown);
        }

        let client_id = Uuid::now_v7().to_string();
        let (tx, rx) = mpsc::channel(CLIENT_QUEUE_CAPACITY);
        let client = Arc::new(ClientHandle::new(client_id.clone(), tx, metadata.clone()));

        {
            let mut st = self.state.write().await;
            if !st.clients.is_empty() {
                return Err(ProxyError::SessionLocked);
            }
            let _ = st.clients.insert(client_id.clone(), client);
        }

        counter!("clients_connected_total").increment(1);
        self.bus
            .dispatch(ProxyEvent::client_connected(&client_id, &metadata));
        info!(client_id = %client_id, "client registered");

        Ok((client_id, rx))
    }

    async fn remove_client(&self, client_id: &str) -> Result<(), ProxyError> {
        let client = {
            let mut st = self.state.write().await;
            st.clients.remove(client_id)
        }
        .ok_or_else(|| ProxyError::ClientNotFound {
            client_id: client_id.to_string(),
        })?;

        client.close_queue();
        if client.mark_disconnected() {
            self.bus.dispatch(ProxyEvent::client_disconnected(client_id));
        }
        counter!("clients_disconnected_total").increment(1);

        let remaining = self.state.read().await.clients.len();
        info!(client_id, remaining, "client removed");
        Ok(())
    }

    async fn client_count(&self) -> usize {
        self.state.read().await.clients.len()
    }

    async fn clients(&self) -> Vec<ClientInfo> {
        self.state
            .read()
            .await
            .clients
            .values()
            .map(|c| c.info())
            .collect()
    }
}

#[async_trait]
impl ConnectionManager for CdpProxy {
    async fn is_connected(&self) -> bool {
        self.state.read().await.connected
    }

    async fn browser_info(&self) -> Result<BrowserInfo, ProxyError> {
        discovery::fetch_browser_info(&self.http, &self.config.browser_url).await
    }
}

#[async_trait]
impl MessageHandler for CdpProxy {
    async fn handle_client_frame(&self, client_id: &str, frame: String) -> Result<(), ProxyError> {
        if let Some(msg) = CdpMessage::parse(&frame) {
            if msg.is_command() {
                debug!(client_id, method = %msg.method, id = msg.id, "client command");
                self.bus.dispatch(ProxyEvent::cdp_command(
                    msg.method.clone(),
                    msg.params.clone(),
                    client_id,
                ));
            }
        }

        tokio::select! {
            res = self.upstream_tx.send(frame) => res.map_err(|_| ProxyError::ShuttingDown),
            () = self.shutdown.cancelled() => Err(ProxyError::ShuttingDown),
        }
    }

    async fn send_to_client(&self, client_id: &str, frame: String) -> Result<(), ProxyError> {
        let st = self.state.read().await;
        let client = st
            .clients
            .get(client_id)
            .ok_or_else(|| ProxyError::ClientNotFound {
                client_id: client_id.to_string(),
            })?;

        match client.send(frame) {
            SendOutcome::Sent => Ok(()),
            SendOutcome::Full => Err(ProxyError::QueueFull {
                client_id: client_id.to_string(),
            }),
            SendOutcome::Closed => Err(ProxyError::ClientNotFound {
                client_id: client_id.to_string(),
            }),
        }
    }
}
