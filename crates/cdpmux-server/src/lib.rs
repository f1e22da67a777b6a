//! # cdpmux-server
//!
//! The downstream-facing surface of the proxy:
//!
//! - [`server::ProxyServer`]: the axum router (discovery reverse proxy,
//!   `/devtools` WebSocket upgrades, status API, health, metrics)
//! - [`rewrite`]: rewrites browser discovery documents so advertised
//!   WebSocket URLs point back at the proxy's external address
//! - [`ws`]: per-client reader/writer pumps bridging an axum socket to the
//!   fabric
//! - [`config`]: file/env configuration loading
//! - [`shutdown`]: graceful shutdown coordination

#![deny(unsafe_code)]

pub mod config;
pub mod metrics;
pub mod proxy_http;
pub mod rewrite;
pub mod server;
pub mod shutdown;
pub mod ws;

pub use config::Config;
pub use server::ProxyServer;
pub use shutdown::ShutdownCoordinator;
