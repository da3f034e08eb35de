//! # offcache
//!
//! The offline-caching layer of a progressive web app's service worker, as a
//! library: versioned cache stores, per-request caching strategies, install
//! and activate lifecycle, and the push notification bridge.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use offcache::config::WorkerConfig;
//! use offcache::network::HttpNetwork;
//! use offcache::registration::Registration;
//! use offcache::server::Server;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = WorkerConfig::default();
//!     let network = Arc::new(HttpNetwork::new(config.app_origin.clone())?);
//!     let registration = Arc::new(Registration::builder(network).build());
//!     registration.register(config).await?;
//!
//!     let server = Server::bind("127.0.0.1:8080").await?;
//!     server.serve(registration).await?;
//!     Ok(())
//! }
//! ```

pub mod background;
pub mod cache;
pub mod clients;
pub mod config;
pub mod expiry;
pub mod http;
pub mod lifecycle;
pub mod network;
pub mod notification;
pub mod registration;
pub mod server;
pub mod strategy;
pub mod worker;

pub use cache::{Cache, CacheError, CacheStorage};
pub use config::{ConfigError, WorkerConfig, WorkerMode};
pub use http::{Headers, Method, Request, RequestMode, Response, ResponseType, StatusCode};
pub use lifecycle::{LifecycleError, WorkerState};
pub use network::{HttpNetwork, Network, NetworkError};
pub use registration::Registration;
pub use server::{Server, ServerError};
pub use strategy::RequestClass;
pub use worker::{Event, EventOutcome, Worker, WorkerError};
