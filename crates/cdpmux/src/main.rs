//! # cdpmux
//!
//! Multiplexing reverse proxy binary: wires the fabric to the HTTP/WebSocket
//! surface and runs until interrupted.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{debug, info};

use cdpmux_core::bus::EventBus;
use cdpmux_proxy::CdpProxy;
use cdpmux_server::{metrics, Config, ProxyServer};

/// CDP multiplexing reverse proxy.
#[derive(Parser, Debug)]
#[command(name = "cdpmux", about = "Multiplexing reverse proxy for the Chrome DevTools Protocol")]
struct Cli {
    /// Port to listen on.
    #[arg(long)]
    port: Option<u16>,

    /// Browser DevTools URL to proxy.
    #[arg(long)]
    browser_url: Option<String>,

    /// Maximum WebSocket message size in bytes.
    #[arg(long)]
    max_message_size: Option<usize>,

    /// Upstream connection timeout in seconds.
    #[arg(long)]
    connection_timeout: Option<u64>,

    /// Optional path to a JSON config file.
    #[arg(long)]
    config: Option<PathBuf>,
}

impl Cli {
    /// Flags override whatever the file/env layering produced.
    fn apply(&self, config: &mut Config) {
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(ref url) = self.browser_url {
            config.browser_url = url.clone();
        }
        if let Some(size) = self.max_message_size {
            config.max_message_size = size;
        }
        if let Some(timeout) = self.connection_timeout {
            config.connection_timeout_seconds = timeout;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    cdpmux_core::logging::init_subscriber("info");

    let mut config = Config::load(args.config.as_deref());
    args.apply(&mut config);
    info!(
        port = config.port,
        browser_url = %config.browser_url,
        frontend_url = %config.frontend_url,
        "starting cdpmux"
    );

    let metrics_handle = metrics::install_recorder();

    let bus = Arc::new(EventBus::new());
    // Wildcard subscription doubles as the audit log.
    bus.register_any(|event| {
        debug!(
            kind = event.kind.as_str(),
            method = event.method.as_deref().unwrap_or(""),
            source_id = event.source_id.as_deref().unwrap_or(""),
            "proxy event"
        );
    });

    let proxy = CdpProxy::new(config.proxy_config(), bus);
    let pump_handles = proxy.start();

    let server = ProxyServer::new(config, proxy.clone(), metrics_handle);
    let (addr, server_handle) = server.listen().await.context("failed to bind listener")?;
    info!(addr = %addr, "cdpmux listening");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;

    info!("shutting down");
    proxy.shutdown().await;

    let mut handles = pump_handles;
    handles.push(server_handle);
    server
        .shutdown_coordinator()
        .graceful_shutdown(handles, None)
        .await;

    info!("shutdown complete");
    Ok(())
}
