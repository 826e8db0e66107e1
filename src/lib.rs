//! Shadowgate - A reverse-proxy gateway in front of a VPN panel
//!
//! This library provides a gateway that:
//! - Forwards a Host-guarded dashboard path to the panel over HTTP
//! - Discovers WebSocket listeners from the panel's administrative API
//! - Relays upgraded connections to those listeners frame by frame
//! - Keeps one authenticated panel session, renewing it on rejection
//! - Republishes the routing table atomically on every synchronization

pub mod config;
pub mod error;
pub mod forward;
pub mod guard;
pub mod inventory;
pub mod proxy;
pub mod relay;
pub mod routes;
pub mod session;
pub mod status;
pub mod sync;
