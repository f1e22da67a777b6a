//! Client WebSocket sessions.
//!
//! Each accepted debugger client gets a reader and a writer pump. The reader
//! funnels frames into the fabric's upstream queue (blocking backpressure);
//! the writer drains the client's outbound queue and keeps the link alive
//! with pings. Reads run under a pong-reset deadline so a silent peer is
//! eventually dropped.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{close_code, CloseFrame, Message, Utf8Bytes, WebSocket};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use cdpmux_proxy::{ClientManager, MessageHandler, ProxyApi, ProxyError};

/// Deadline for a single socket write.
pub const WRITE_WAIT: Duration = Duration::from_secs(10);
/// A client must show life within this window.
pub const PONG_WAIT: Duration = Duration::from_secs(60);
/// Ping cadence; must be shorter than [`PONG_WAIT`].
pub const PING_PERIOD: Duration = Duration::from_secs(54);

/// Build the metadata map captured at attach time.
///
/// Query parameters are folded in first-value-wins; the reserved `path` and
/// `target_id` entries always reflect the request path.
pub fn extract_client_metadata(
    path: &str,
    query: Option<&str>,
    user_agent: Option<&str>,
    remote_addr: SocketAddr,
) -> HashMap<String, String> {
    let mut metadata = HashMap::new();
    let _ = metadata.insert("user_agent".to_string(), user_agent.unwrap_or_default().to_string());
    let _ = metadata.insert("remote_addr".to_string(), remote_addr.to_string());

    if let Some(query) = query {
        let mut first_values: HashMap<String, String> = HashMap::new();
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            let _ = first_values
                .entry(key.into_owned())
                .or_insert_with(|| value.into_owned());
        }
        metadata.extend(first_values);
    }

    let _ = metadata.insert("path".to_string(), path.to_string());
    if let Some(rest) = path.strip_prefix("page/") {
        let target_id = rest.split('/').next().unwrap_or_default();
        if !target_id.is_empty() {
            let _ = metadata.insert("target_id".to_string(), target_id.to_string());
        }
    }

    metadata
}

/// Run one client session from upgrade through disconnect.
///
/// Admission happens here so a policy rejection can be answered on the
/// socket: a locked session gets a policy-violation close frame before the
/// connection is dropped.
pub async fn run_client_session(
    socket: WebSocket,
    proxy: Arc<dyn ProxyApi>,
    metadata: HashMap<String, String>,
    shutdown: CancellationToken,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let (client_id, outbound_rx) = match proxy.add_client(metadata).await {
        Ok(admitted) => admitted,
        Err(ProxyError::SessionLocked) => {
            warn!("rejecting client: session already locked by another client");
            let _ = ws_tx
                .send(Message::Close(Some(CloseFrame {
                    code: close_code::POLICY,
                    reason: Utf8Bytes::from_static("session already locked by another client"),
                })))
                .await;
            return;
        }
        Err(e) => {
            warn!(error = %e, "client admission failed");
            return;
        }
    };

    info!(client_id = %client_id, "client connected");

    let writer = tokio::spawn(run_client_writer(
        ws_tx,
        outbound_rx,
        client_id.clone(),
        shutdown.clone(),
    ));

    // Reader loop. Every received frame resets the pong deadline.
    loop {
        let item = tokio::select! {
            read = tokio::time::timeout(PONG_WAIT, ws_rx.next()) => match read {
                Ok(item) => item,
                Err(_) => {
                    warn!(client_id = %client_id, "client silent past pong deadline");
                    break;
                }
            },
            () = shutdown.cancelled() => break,
        };

        match item {
            Some(Ok(Message::Text(text))) => {
                match proxy.handle_client_frame(&client_id, text.to_string()).await {
                    Ok(()) => {}
                    Err(ProxyError::ShuttingDown) => break,
                    Err(e) => debug!(client_id = %client_id, error = %e, "client frame not forwarded"),
                }
            }
            Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                Ok(text) => {
                    match proxy.handle_client_frame(&client_id, text.to_string()).await {
                        Ok(()) => {}
                        Err(ProxyError::ShuttingDown) => break,
                        Err(e) => debug!(client_id = %client_id, error = %e, "client frame not forwarded"),
                    }
                }
                Err(_) => {
                    debug!(client_id = %client_id, len = data.len(), "ignoring non-UTF8 binary frame");
                }
            },
            Some(Ok(Message::Close(frame))) => {
                let code = frame.as_ref().map(|f| f.code);
                if code == Some(close_code::AWAY) {
                    debug!(client_id = %client_id, "client going away");
                } else {
                    warn!(client_id = %client_id, ?code, "client closed unexpectedly");
                }
                break;
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
            Some(Err(e)) => {
                warn!(client_id = %client_id, error = %e, "client read failed");
                break;
            }
            None => break,
        }
    }

    writer.abort();
    // Shutdown may have already drained the registry.
    if let Err(e) = proxy.remove_client(&client_id).await {
        debug!(client_id = %client_id, error = %e, "client already removed");
    }
    info!(client_id = %client_id, "client disconnected");
}

/// Writer pump: outbound queue plus periodic pings, terminated by the first
/// write error.
async fn run_client_writer(
    mut ws_tx: futures::stream::SplitSink<WebSocket, Message>,
    mut outbound_rx: tokio::sync::mpsc::Receiver<String>,
    client_id: String,
    shutdown: CancellationToken,
) {
    let mut ping = tokio::time::interval(PING_PERIOD);
    // The first tick completes immediately.
    let _ = ping.tick().await;

    loop {
        tokio::select! {
            maybe = outbound_rx.recv() => {
                let Some(frame) = maybe else { break };
                match tokio::time::timeout(WRITE_WAIT, ws_tx.send(Message::Text(frame.into()))).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        debug!(client_id = %client_id, error = %e, "client write failed");
                        break;
                    }
                    Err(_) => {
                        warn!(client_id = %client_id, "client write timed out");
                        break;
                    }
                }
            }
            _ = ping.tick() => {
                if ws_tx.send(Message::Ping(Bytes::new())).await.is_err() {
                    debug!(client_id = %client_id, "client ping failed");
                    break;
                }
            }
            () = shutdown.cancelled() => break,
        }
    }
}
