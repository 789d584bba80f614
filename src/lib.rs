//! droplet-proxy - a hot-reloadable load-balancing reverse proxy.
//!
//! Client HTTP requests are forwarded to one of a set of backend hosts ("droplets")
//! listed in an inventory file. Every backend carries an instrumented transport and a
//! monitor that probes its health and keeps rolling latency and failure-rate averages
//! once per second. The balancer picks among healthy backends by round robin, least
//! connections or lowest latency.
//!
//! # Features
//! - HTTP/1.1 and HTTP/2 frontend, optional TLS
//! - Websocket upgrades relayed over a dedicated backend connection
//! - `X-Forwarded-For` folding
//! - Live reload of the configuration and inventory files, with validation
//! - Inventory persistence in TOML
//! - Two-stage graceful shutdown with advisory locks for critical writes
//!
//! # Quick Example
//! ```no_run
//! use std::sync::Arc;
//!
//! use droplet_proxy::{ProxyHandler, adapters::build_load_balancer, config::load_config};
//!
//! # #[tokio::main] async fn main() -> eyre::Result<()> {
//! let config = load_config("config.toml").await?;
//! let balancer = build_load_balancer(&config, None).await?;
//! let handler = Arc::new(ProxyHandler::new(Arc::new(config), Arc::new(balancer)));
//! let app = droplet_proxy::adapters::router(handler);
//! # let _ = app;
//! # Ok(()) }
//! ```
//!
//! # Architecture
//! The crate separates **ports** (traits) from **adapters** (implementations) while keeping
//! backend state, balancing and persistence inside `core`.
//!
//! # Error Handling
//! Domain operations return `thiserror` enums (`InventoryError`, `BackendError`,
//! `ValidationError`, `HttpClientError`); application plumbing uses `eyre::Result`.
pub mod config;
pub mod ports;
pub mod tracing_setup;
pub mod utils;

pub mod adapters;
pub mod core;

// Re-export the specific types needed by the binary crate
pub use crate::{
    adapters::{HttpClientAdapter, ProxyHandler, ReloadCoordinator},
    core::{Backend, Droplet, Inventory, LoadBalancer},
    ports::http_client::HttpClient,
    utils::GracefulShutdown,
};
