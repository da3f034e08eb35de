//! Runs an offline-caching proxy in front of the app origin.
//!
//! ```text
//! cargo run --example proxy -- [config.json] [cache-dir]
//! RUST_LOG=offcache=debug cargo run --example proxy
//! ```
//!
//! Point a browser's HTTP proxy at `127.0.0.1:8080`. Stores are persisted
//! under `cache-dir` (default `.offcache`) so a restart keeps them.

use std::sync::Arc;

use offcache::cache::CacheStorage;
use offcache::config::WorkerConfig;
use offcache::network::HttpNetwork;
use offcache::notification::ChannelNotifier;
use offcache::registration::Registration;
use offcache::server::Server;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("offcache=info")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let config = match args.next() {
        Some(path) => WorkerConfig::from_file(path)?,
        None => WorkerConfig::default(),
    };
    let cache_dir = args.next().unwrap_or_else(|| ".offcache".to_owned());

    let notifier = ChannelNotifier::new(16);
    let mut notifications = notifier.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = notifications.recv().await {
            info!(?event, "notification");
        }
    });

    let network = Arc::new(HttpNetwork::new(config.app_origin.clone())?);
    let registration = Registration::builder(network)
        .caches(CacheStorage::persistent(&cache_dir).await?)
        .notifier(Arc::new(notifier))
        .build();
    let registration = Arc::new(registration);

    // A failed update keeps whichever version a previous run left active.
    match registration.register(config).await {
        Ok(active) => info!(epoch = %active.epoch(), cache_dir = %cache_dir, "worker active"),
        Err(e) => match registration.active().await {
            Some(active) => warn!(error = %e, epoch = %active.epoch(), "update failed, serving previous version"),
            None => warn!(error = %e, "install failed, passing traffic through"),
        },
    }

    let server = Server::bind("127.0.0.1:8080").await?;
    println!("offcache proxy listening on http://{}", server.local_addr());
    server
        .serve_until(registration, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "cannot listen for ctrl-c");
                std::future::pending::<()>().await;
            }
        })
        .await?;
    Ok(())
}
