//! # cdpmux-core
//!
//! Foundation types for the cdpmux proxy.
//!
//! This crate provides the shared vocabulary the other cdpmux crates depend on:
//!
//! - **CDP codec**: [`message::CdpMessage`] with lenient parsing and
//!   command/event/response classification of DevTools Protocol frames
//! - **Events**: [`events::ProxyEvent`], a closed sum of lifecycle and
//!   observation event kinds
//! - **Bus**: [`bus::EventBus`] for fire-and-forget topic dispatch with a
//!   wildcard subscription
//! - **Logging**: [`logging::init_subscriber`] for tracing subscriber setup
//!
//! ## Crate Position
//!
//! Foundation crate. Depended on by `cdpmux-proxy` and `cdpmux-server`.

#![deny(unsafe_code)]

pub mod bus;
pub mod events;
pub mod logging;
pub mod message;
