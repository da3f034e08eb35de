//! Lifecycle controller: install and activate.
//!
//! ```text
//! Parsed ──install──▶ Installing ──▶ Installed ──activate──▶ Activating ──▶ Activated
//!   │                     │              ▲                                     │
//!   └───────resume────────┼──────────────┘                                     │
//!                         └──(precache failure)──▶ Redundant ◀──────retire─────┘
//! ```
//!
//! Install precaches the shell manifest all-or-nothing. Activate deletes
//! every store that is not part of the current epoch and claims the open
//! clients. A worker whose shell store survived a restart is resumed
//! straight to `Installed`. Transitions are checked: an event arriving in
//! the wrong state is an [`LifecycleError::InvalidState`].

use std::fmt;
use std::sync::Arc;

use futures::future::try_join_all;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::cache::{CacheError, CacheStorage};
use crate::clients::Clients;
use crate::config::{ConfigError, WorkerConfig, WorkerMode};
use crate::http::{Method, Request, Response};
use crate::network::Network;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum WorkerState {
    #[default]
    Parsed,
    Installing,
    Installed,
    Activating,
    Activated,
    Redundant,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Parsed => "parsed",
            Self::Installing => "installing",
            Self::Installed => "installed",
            Self::Activating => "activating",
            Self::Activated => "activated",
            Self::Redundant => "redundant",
        })
    }
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("install failed: could not precache {url}: {reason}")]
    InstallFailed { url: String, reason: String },

    #[error("cannot {event} a worker in state {actual} (expected {expected})")]
    InvalidState {
        event: &'static str,
        expected: WorkerState,
        actual: WorkerState,
    },

    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}

/// Drives a worker through install and activation.
pub struct Lifecycle {
    config: Arc<WorkerConfig>,
    caches: CacheStorage,
    network: Arc<dyn Network>,
    clients: Clients,
    state: watch::Sender<WorkerState>,
}

impl fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lifecycle")
            .field("state", &*self.state.borrow())
            .field("epoch", &self.config.epoch)
            .finish_non_exhaustive()
    }
}

impl Lifecycle {
    pub fn new(
        config: Arc<WorkerConfig>,
        caches: CacheStorage,
        network: Arc<dyn Network>,
        clients: Clients,
    ) -> Self {
        let (state, _) = watch::channel(WorkerState::Parsed);
        Self {
            config,
            caches,
            network,
            clients,
            state,
        }
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    pub fn is_activated(&self) -> bool {
        self.state() == WorkerState::Activated
    }

    /// Receives every state change from now on.
    pub fn subscribe(&self) -> watch::Receiver<WorkerState> {
        self.state.subscribe()
    }

    /// Handles the install event.
    ///
    /// # Errors
    ///
    /// Fails if the worker was already installed, or if any manifest entry
    /// could not be fetched with an OK status or stored. A failed install
    /// writes nothing and leaves the worker [`WorkerState::Redundant`].
    pub async fn install(&self) -> Result<(), LifecycleError> {
        self.advance("install", WorkerState::Parsed, WorkerState::Installing)?;

        if self.config.mode == WorkerMode::Development {
            debug!("development mode, skipping precache");
        } else if let Err(e) = self.precache().await {
            error!(error = %e, "install failed, worker is redundant");
            self.state.send_replace(WorkerState::Redundant);
            return Err(e);
        }

        self.state.send_replace(WorkerState::Installed);
        info!(epoch = %self.config.epoch, "installed");
        Ok(())
    }

    /// Marks a worker whose shell store is already complete as installed,
    /// without fetching anything.
    pub fn resume(&self) -> Result<(), LifecycleError> {
        self.advance("resume", WorkerState::Parsed, WorkerState::Installed)?;
        info!(epoch = %self.config.epoch, "resumed previously installed worker");
        Ok(())
    }

    /// Takes the worker out of service for good.
    pub fn retire(&self) {
        let previous = self.state.send_replace(WorkerState::Redundant);
        if previous != WorkerState::Redundant {
            info!(epoch = %self.config.epoch, was = %previous, "worker retired");
        }
    }

    /// Handles the activate event. Returns the names of the purged stores.
    ///
    /// A store that fails to delete is logged and left behind; it does not
    /// fail activation.
    pub async fn activate(&self) -> Result<Vec<String>, LifecycleError> {
        self.advance("activate", WorkerState::Installed, WorkerState::Activating)?;

        let mut purged = Vec::new();
        if self.config.mode == WorkerMode::Production {
            let known = self.config.known_stores();
            for name in self.caches.keys().await {
                if known.contains(&name) {
                    continue;
                }
                match self.caches.delete(&name).await {
                    Ok(_) => {
                        info!(store = %name, "deleted stale cache store");
                        purged.push(name);
                    }
                    Err(e) => warn!(store = %name, error = %e, "failed to delete stale cache store"),
                }
            }
            self.clients.claim().await;
        }

        self.state.send_replace(WorkerState::Activated);
        info!(epoch = %self.config.epoch, purged = purged.len(), "activated");
        Ok(purged)
    }

    async fn precache(&self) -> Result<(), LifecycleError> {
        let shell = self.caches.open(&self.config.shell_store()).await?;
        let requests = self
            .config
            .shell_manifest
            .iter()
            .map(|path| self.config.app_resource(path).map(|url| Request::new(Method::Get, url)))
            .collect::<Result<Vec<_>, ConfigError>>()?;

        let responses = try_join_all(requests.iter().map(|r| self.fetch_ok(r))).await?;
        let pairs: Vec<(Request, Response)> = requests.into_iter().zip(responses).collect();

        shell.put_all(&pairs).await?;
        info!(store = %shell.name(), entries = pairs.len(), "precached app shell");
        Ok(())
    }

    async fn fetch_ok(&self, request: &Request) -> Result<Response, LifecycleError> {
        let failed = |reason: String| LifecycleError::InstallFailed {
            url: request.url().to_string(),
            reason,
        };
        let response = self
            .network
            .fetch(request)
            .await
            .map_err(|e| failed(e.to_string()))?;
        if !response.is_ok() {
            return Err(failed(format!("status {}", response.status())));
        }
        Ok(response)
    }

    fn advance(
        &self,
        event: &'static str,
        expected: WorkerState,
        next: WorkerState,
    ) -> Result<(), LifecycleError> {
        let mut actual = expected;
        let moved = self.state.send_if_modified(|state| {
            if *state == expected {
                *state = next;
                true
            } else {
                actual = *state;
                false
            }
        });
        if moved {
            Ok(())
        } else {
            Err(LifecycleError::InvalidState {
                event,
                expected,
                actual,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::{ClientQuery, ClientType};
    use crate::http::StatusCode;
    use crate::network::mock::MockNetwork;

    const MANIFEST: [&str; 5] = [
        "http://localhost:9000/",
        "http://localhost:9000/index.html",
        "http://localhost:9000/manifest.json",
        "http://localhost:9000/styles/main.css",
        "http://localhost:9000/images/icons/icon-192x192.png",
    ];

    fn online_network() -> Arc<MockNetwork> {
        let network = Arc::new(MockNetwork::new());
        for url in MANIFEST {
            network.route(url, Response::new(StatusCode::OK).body(url));
        }
        network
    }

    fn lifecycle(config: WorkerConfig, caches: &CacheStorage, network: Arc<MockNetwork>) -> Lifecycle {
        Lifecycle::new(Arc::new(config), caches.clone(), network, Clients::new())
    }

    #[tokio::test]
    async fn install_precaches_manifest() {
        let caches = CacheStorage::in_memory();
        let network = online_network();
        let lc = lifecycle(WorkerConfig::default(), &caches, network.clone());

        lc.install().await.unwrap();
        assert_eq!(lc.state(), WorkerState::Installed);
        assert_eq!(network.calls(), MANIFEST.len());

        let shell = caches.open("dicoding-story-shell-v1").await.unwrap();
        assert_eq!(shell.len().await, MANIFEST.len());
        let css = shell
            .match_request(&Request::get(MANIFEST[3]).unwrap())
            .await
            .unwrap();
        assert_eq!(css.body_bytes().as_ref(), MANIFEST[3].as_bytes());
    }

    #[tokio::test]
    async fn install_is_all_or_nothing() {
        let caches = CacheStorage::in_memory();
        let network = online_network();
        network.route(MANIFEST[2], Response::new(StatusCode::NOT_FOUND));
        let lc = lifecycle(WorkerConfig::default(), &caches, network);

        let err = lc.install().await.unwrap_err();
        assert!(matches!(err, LifecycleError::InstallFailed { .. }));
        assert_eq!(lc.state(), WorkerState::Redundant);
        let shell = caches.open("dicoding-story-shell-v1").await.unwrap();
        assert!(shell.is_empty().await);

        let again = lc.activate().await.unwrap_err();
        assert!(matches!(
            again,
            LifecycleError::InvalidState { actual: WorkerState::Redundant, .. }
        ));
    }

    #[tokio::test]
    async fn install_fails_offline() {
        let caches = CacheStorage::in_memory();
        let network = online_network();
        network.set_offline(true);
        let lc = lifecycle(WorkerConfig::default(), &caches, network);

        assert!(lc.install().await.is_err());
        assert_eq!(lc.state(), WorkerState::Redundant);
    }

    #[tokio::test]
    async fn activate_before_install_is_rejected() {
        let caches = CacheStorage::in_memory();
        let lc = lifecycle(WorkerConfig::default(), &caches, online_network());
        let err = lc.activate().await.unwrap_err();
        assert!(matches!(
            err,
            LifecycleError::InvalidState { expected: WorkerState::Installed, actual: WorkerState::Parsed, .. }
        ));
    }

    #[tokio::test]
    async fn activation_purges_stale_stores() {
        let caches = CacheStorage::in_memory();
        for name in ["dicoding-story-shell-v1", "dicoding-story-data-v1", "dicoding-story-shell-v2"] {
            caches.open(name).await.unwrap();
        }
        let config = WorkerConfig::default().with_epoch("v2");
        let lc = lifecycle(config, &caches, online_network());

        lc.install().await.unwrap();
        let mut purged = lc.activate().await.unwrap();
        purged.sort();
        assert_eq!(purged, vec!["dicoding-story-data-v1", "dicoding-story-shell-v1"]);
        assert_eq!(caches.keys().await, vec!["dicoding-story-shell-v2"]);
        assert!(lc.is_activated());
    }

    #[tokio::test]
    async fn activation_claims_clients() {
        let caches = CacheStorage::in_memory();
        let clients = Clients::new();
        clients
            .add(url::Url::parse("http://localhost:9000/").unwrap(), ClientType::Window)
            .await;
        let lc = Lifecycle::new(
            Arc::new(WorkerConfig::default()),
            caches,
            online_network(),
            clients.clone(),
        );

        lc.install().await.unwrap();
        assert!(clients.match_all(ClientQuery::windows()).await.is_empty());
        lc.activate().await.unwrap();
        assert_eq!(clients.match_all(ClientQuery::windows()).await.len(), 1);
    }

    #[tokio::test]
    async fn development_mode_skips_precache_and_purge() {
        let caches = CacheStorage::in_memory();
        caches.open("dicoding-story-shell-v0").await.unwrap();
        let network = online_network();
        let config = WorkerConfig::default().with_mode(WorkerMode::Development);
        let lc = lifecycle(config, &caches, network.clone());

        lc.install().await.unwrap();
        assert!(lc.activate().await.unwrap().is_empty());
        assert_eq!(network.calls(), 0);
        assert_eq!(caches.keys().await, vec!["dicoding-story-shell-v0"]);
    }

    #[tokio::test]
    async fn storage_failure_fails_install_and_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("caches");
        let caches = CacheStorage::persistent(&root).await.unwrap();
        let shell = caches.open("dicoding-story-shell-v1").await.unwrap();
        std::fs::remove_dir_all(&root).unwrap();
        let lc = lifecycle(WorkerConfig::default(), &caches, online_network());

        let err = lc.install().await.unwrap_err();
        assert!(matches!(err, LifecycleError::Cache(CacheError::Io { .. })));
        assert_eq!(lc.state(), WorkerState::Redundant);
        assert!(shell.is_empty().await);
    }

    #[tokio::test]
    async fn resume_skips_precache_and_retire_is_final() {
        let caches = CacheStorage::in_memory();
        let network = online_network();
        let lc = lifecycle(WorkerConfig::default(), &caches, network.clone());

        lc.resume().unwrap();
        assert_eq!(lc.state(), WorkerState::Installed);
        assert_eq!(network.calls(), 0);
        lc.activate().await.unwrap();

        lc.retire();
        assert_eq!(lc.state(), WorkerState::Redundant);
        assert!(matches!(
            lc.resume().unwrap_err(),
            LifecycleError::InvalidState { event: "resume", .. }
        ));
    }

    #[tokio::test]
    async fn subscribers_observe_transitions() {
        let caches = CacheStorage::in_memory();
        let lc = lifecycle(WorkerConfig::default(), &caches, online_network());
        let mut rx = lc.subscribe();

        lc.install().await.unwrap();
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), WorkerState::Installed);

        let err = lc.install().await.unwrap_err();
        assert!(matches!(err, LifecycleError::InvalidState { event: "install", .. }));
        assert!(!rx.has_changed().unwrap());
    }
}
