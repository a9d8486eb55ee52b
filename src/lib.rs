//! Devgate - a local development router that boots backends on demand
//!
//! This library provides a per-hostname development router that:
//! - Routes HTTP traffic by Host header to an app directory under a root
//! - Starts the app's backend process on the first request for its hostname
//! - Proxies requests over a unix socket (HTTP/1.0) or a local TCP port
//! - Stops backends that have been idle longer than their idle limit
//! - Answers DNS address queries with the loopback address

pub mod app;
pub mod config;
pub mod dns;
pub mod error;
pub mod plugin;
pub mod pool;
pub mod proxy;
pub mod reaper;
pub mod registry;
pub mod router;
pub mod unix_http;

/// Package name from Cargo.toml
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
/// Package version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
