//! Registration: the installing, waiting and active slots of one app scope.
//!
//! ```text
//! update(config) ──▶ installing ──ok──▶ waiting ──skip_waiting──▶ active
//!                        │                                        (old active retired)
//!                        └──failed──▶ dropped, active untouched
//! ```
//!
//! A new version installs beside the active one, and the active worker keeps
//! answering fetches until the newcomer is activated. [`Registration::register`]
//! does both steps at once, since this worker always skips waiting.
//!
//! The active version survives a restart through its stores: with persistent
//! [`CacheStorage`], a non-empty shell store can only come from a completed
//! install, so the first `register` after a restart resumes that version
//! before trying to install anything.

use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::background::TaskSet;
use crate::cache::CacheStorage;
use crate::clients::Clients;
use crate::config::WorkerConfig;
use crate::expiry::{Clock, SystemClock};
use crate::http::{Request, Response};
use crate::network::Network;
use crate::notification::{Notifier, TracingNotifier};
use crate::worker::{Event, EventOutcome, Worker, WorkerError};

#[derive(Default)]
struct Slots {
    installing: Option<Arc<Worker>>,
    waiting: Option<Arc<Worker>>,
    active: Option<Arc<Worker>>,
}

/// Builds a [`Registration`]. Only the network is required.
pub struct RegistrationBuilder {
    network: Arc<dyn Network>,
    caches: Option<CacheStorage>,
    notifier: Option<Arc<dyn Notifier>>,
    clock: Option<Arc<dyn Clock>>,
    clients: Option<Clients>,
}

impl RegistrationBuilder {
    #[must_use]
    pub fn caches(mut self, caches: CacheStorage) -> Self {
        self.caches = Some(caches);
        self
    }

    #[must_use]
    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    #[must_use]
    pub fn clients(mut self, clients: Clients) -> Self {
        self.clients = Some(clients);
        self
    }

    pub fn build(self) -> Registration {
        Registration {
            network: self.network,
            caches: self.caches.unwrap_or_else(CacheStorage::in_memory),
            notifier: self
                .notifier
                .unwrap_or_else(|| Arc::new(TracingNotifier) as Arc<dyn Notifier>),
            clock: self
                .clock
                .unwrap_or_else(|| Arc::new(SystemClock) as Arc<dyn Clock>),
            clients: self.clients.unwrap_or_default(),
            tasks: TaskSet::new(),
            slots: RwLock::new(Slots::default()),
            updating: Mutex::new(()),
        }
    }
}

/// Owns every worker version of one app and routes events to the active one.
///
/// All versions share the registration's stores, network, clients and
/// background task set.
pub struct Registration {
    network: Arc<dyn Network>,
    caches: CacheStorage,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    clients: Clients,
    tasks: TaskSet,
    slots: RwLock<Slots>,
    /// One update at a time.
    updating: Mutex<()>,
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("caches", &self.caches)
            .finish_non_exhaustive()
    }
}

impl Registration {
    pub fn builder(network: Arc<dyn Network>) -> RegistrationBuilder {
        RegistrationBuilder {
            network,
            caches: None,
            notifier: None,
            clock: None,
            clients: None,
        }
    }

    pub fn caches(&self) -> &CacheStorage {
        &self.caches
    }

    pub fn clients(&self) -> &Clients {
        &self.clients
    }

    /// Background cache writes of every worker in this registration.
    pub fn tasks(&self) -> &TaskSet {
        &self.tasks
    }

    pub async fn active(&self) -> Option<Arc<Worker>> {
        self.slots.read().await.active.clone()
    }

    pub async fn waiting(&self) -> Option<Arc<Worker>> {
        self.slots.read().await.waiting.clone()
    }

    pub async fn installing(&self) -> Option<Arc<Worker>> {
        self.slots.read().await.installing.clone()
    }

    /// Brings `config` into service: resumes a version left installed by a
    /// previous run, installs `config` if it is not that version, and
    /// activates it at once.
    ///
    /// Returns the active worker. If the new version fails to install, the
    /// error is returned and whatever was active keeps serving.
    pub async fn register(&self, config: WorkerConfig) -> Result<Arc<Worker>, WorkerError> {
        let _updating = self.updating.lock().await;

        let active = match self.active().await {
            Some(active) => Some(active),
            None => self.restore(&config).await?,
        };
        if let Some(active) = active.filter(|a| a.epoch() == config.epoch) {
            debug!(epoch = %config.epoch, "registration already up to date");
            return Ok(active);
        }

        self.install(config).await?;
        self.promote().await
    }

    /// Installs `config` as a new version and leaves it waiting. The active
    /// worker, if any, keeps serving.
    pub async fn update(&self, config: WorkerConfig) -> Result<Arc<Worker>, WorkerError> {
        let _updating = self.updating.lock().await;
        self.install(config).await
    }

    /// Activates the waiting worker and retires the one it replaces.
    pub async fn skip_waiting(&self) -> Result<Arc<Worker>, WorkerError> {
        let _updating = self.updating.lock().await;
        self.promote().await
    }

    /// Retires every worker. Fetches pass through from now on.
    pub async fn unregister(&self) {
        let mut slots = self.slots.write().await;
        for worker in [slots.installing.take(), slots.waiting.take(), slots.active.take()]
            .into_iter()
            .flatten()
        {
            worker.lifecycle().retire();
        }
        info!("registration cleared");
    }

    /// Answers a fetch with the active worker, or straight from the network
    /// when nothing is active.
    pub async fn fetch(&self, request: &Request) -> Result<Response, WorkerError> {
        match self.active().await {
            Some(worker) => worker.fetch(request).await,
            None => {
                debug!(url = %request.url(), "no active worker, pass-through fetch");
                Ok(self.network.fetch(request).await?)
            }
        }
    }

    /// Hands a functional event to the active worker.
    pub fn dispatch(&self, event: Event) -> BoxFuture<'_, Result<EventOutcome, WorkerError>> {
        Box::pin(async move {
            if let Event::Fetch(request) = &event {
                return Ok(EventOutcome::Response(self.fetch(request).await?));
            }
            match self.active().await {
                Some(worker) => worker.dispatch(event).await,
                None => Err(WorkerError::NoActiveWorker(event.name())),
            }
        })
    }

    fn build_worker(&self, config: WorkerConfig) -> Result<Arc<Worker>, WorkerError> {
        let worker = Worker::builder(config)
            .caches(self.caches.clone())
            .network(Arc::clone(&self.network))
            .notifier(Arc::clone(&self.notifier))
            .clock(Arc::clone(&self.clock))
            .clients(self.clients.clone())
            .tasks(self.tasks.clone())
            .build()?;
        Ok(Arc::new(worker))
    }

    async fn install(&self, config: WorkerConfig) -> Result<Arc<Worker>, WorkerError> {
        let worker = self.build_worker(config)?;
        self.slots.write().await.installing = Some(Arc::clone(&worker));

        let installed = worker.dispatch(Event::Install).await;
        let mut slots = self.slots.write().await;
        slots.installing = None;
        if let Err(e) = installed {
            warn!(epoch = %worker.epoch(), error = %e, "update failed, keeping the active worker");
            return Err(e);
        }
        if let Some(stale) = slots.waiting.replace(Arc::clone(&worker)) {
            stale.lifecycle().retire();
        }
        info!(epoch = %worker.epoch(), "new worker waiting");
        Ok(worker)
    }

    async fn promote(&self) -> Result<Arc<Worker>, WorkerError> {
        let Some(worker) = self.slots.write().await.waiting.take() else {
            return Err(WorkerError::NoWaitingWorker);
        };
        self.activate(&worker).await?;
        Ok(worker)
    }

    async fn activate(&self, worker: &Arc<Worker>) -> Result<(), WorkerError> {
        if let Err(e) = worker.dispatch(Event::Activate).await {
            worker.lifecycle().retire();
            return Err(e);
        }
        let previous = self.slots.write().await.active.replace(Arc::clone(worker));
        if let Some(previous) = previous {
            previous.lifecycle().retire();
        }
        info!(epoch = %worker.epoch(), "worker active");
        Ok(())
    }

    /// Finds the version whose shell store a previous run completed and
    /// makes it active again. Prefers `config`'s own epoch.
    async fn restore(&self, config: &WorkerConfig) -> Result<Option<Arc<Worker>>, WorkerError> {
        let prefix = format!("{}-shell-", config.store_prefix);
        let mut installed = Vec::new();
        for name in self.caches.keys().await {
            let Some(epoch) = name.strip_prefix(&prefix) else {
                continue;
            };
            if !self.caches.open(&name).await?.is_empty().await {
                installed.push(epoch.to_owned());
            }
        }

        let Some(epoch) = installed
            .iter()
            .find(|e| **e == config.epoch)
            .or_else(|| installed.last())
            .cloned()
        else {
            return Ok(None);
        };

        let worker = self.build_worker(config.clone().with_epoch(epoch))?;
        worker.lifecycle().resume()?;
        self.activate(&worker).await?;
        Ok(Some(worker))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::StatusCode;
    use crate::lifecycle::WorkerState;
    use crate::network::mock::MockNetwork;

    fn online_network() -> Arc<MockNetwork> {
        let network = Arc::new(MockNetwork::new());
        for path in WorkerConfig::default().shell_manifest {
            let url = format!("http://localhost:9000{path}");
            network.route(&url, Response::new(StatusCode::OK).body(format!("shell {path}")));
        }
        network
    }

    fn manifest() -> Request {
        Request::get("http://localhost:9000/manifest.json").unwrap()
    }

    fn v2() -> WorkerConfig {
        WorkerConfig::default().with_epoch("v2")
    }

    #[tokio::test]
    async fn first_registration_installs_and_activates() {
        let network = online_network();
        let reg = Registration::builder(network.clone()).build();

        let active = reg.register(WorkerConfig::default()).await.unwrap();
        assert_eq!(active.state(), WorkerState::Activated);
        assert!(reg.installing().await.is_none());
        assert!(reg.waiting().await.is_none());

        let calls = network.calls();
        let again = reg.register(WorkerConfig::default()).await.unwrap();
        assert!(Arc::ptr_eq(&active, &again));
        assert_eq!(network.calls(), calls);
    }

    #[tokio::test]
    async fn failed_update_keeps_previous_worker_serving() {
        let network = online_network();
        let reg = Registration::builder(network.clone()).build();
        let v1 = reg.register(WorkerConfig::default()).await.unwrap();

        network.set_offline(true);
        assert!(reg.register(v2()).await.is_err());

        let active = reg.active().await.unwrap();
        assert!(Arc::ptr_eq(&active, &v1));
        assert_eq!(active.state(), WorkerState::Activated);
        assert!(reg.installing().await.is_none());
        assert!(reg.waiting().await.is_none());

        let cached = reg.fetch(&manifest()).await.unwrap();
        assert_eq!(cached.body_bytes().as_ref(), b"shell /manifest.json");
        assert!(reg.caches().has("dicoding-story-shell-v1").await);
    }

    #[tokio::test]
    async fn skip_waiting_hands_over_to_the_new_version() {
        let network = online_network();
        let reg = Registration::builder(network.clone()).build();
        let v1 = reg.register(WorkerConfig::default()).await.unwrap();

        let next = reg.update(v2()).await.unwrap();
        assert_eq!(next.state(), WorkerState::Installed);
        assert!(Arc::ptr_eq(&reg.active().await.unwrap(), &v1));

        network.set_offline(true);
        let served = reg.fetch(&manifest()).await.unwrap();
        assert_eq!(served.body_bytes().as_ref(), b"shell /manifest.json");

        let promoted = reg.skip_waiting().await.unwrap();
        assert!(Arc::ptr_eq(&promoted, &next));
        assert_eq!(promoted.state(), WorkerState::Activated);
        assert_eq!(v1.state(), WorkerState::Redundant);
        assert!(reg.waiting().await.is_none());
        assert_eq!(reg.caches().keys().await, vec!["dicoding-story-shell-v2"]);

        assert!(matches!(
            reg.skip_waiting().await.unwrap_err(),
            WorkerError::NoWaitingWorker
        ));
    }

    #[tokio::test]
    async fn restart_offline_resumes_installed_version() {
        let dir = tempfile::tempdir().unwrap();
        {
            let caches = CacheStorage::persistent(dir.path()).await.unwrap();
            let reg = Registration::builder(online_network()).caches(caches).build();
            reg.register(WorkerConfig::default()).await.unwrap();
        }

        let network = Arc::new(MockNetwork::new());
        network.set_offline(true);
        let caches = CacheStorage::persistent(dir.path()).await.unwrap();
        let reg = Registration::builder(network.clone()).caches(caches).build();

        let active = reg.register(WorkerConfig::default()).await.unwrap();
        assert_eq!(active.epoch(), "v1");
        assert_eq!(active.state(), WorkerState::Activated);

        let cached = reg.fetch(&manifest()).await.unwrap();
        assert_eq!(cached.body_bytes().as_ref(), b"shell /manifest.json");
        assert_eq!(network.calls(), 0);
    }

    #[tokio::test]
    async fn restart_with_unreachable_update_serves_previous_version() {
        let dir = tempfile::tempdir().unwrap();
        {
            let caches = CacheStorage::persistent(dir.path()).await.unwrap();
            let reg = Registration::builder(online_network()).caches(caches).build();
            reg.register(WorkerConfig::default()).await.unwrap();
        }

        let network = Arc::new(MockNetwork::new());
        network.set_offline(true);
        let caches = CacheStorage::persistent(dir.path()).await.unwrap();
        let reg = Registration::builder(network).caches(caches).build();

        assert!(reg.register(v2()).await.is_err());
        let active = reg.active().await.unwrap();
        assert_eq!(active.epoch(), "v1");
        let cached = reg.fetch(&manifest()).await.unwrap();
        assert_eq!(cached.body_bytes().as_ref(), b"shell /manifest.json");
    }

    #[tokio::test]
    async fn without_active_worker_fetch_passes_through() {
        let network = online_network();
        network.set_offline(true);
        let reg = Registration::builder(network.clone()).build();
        assert!(reg.register(WorkerConfig::default()).await.is_err());
        assert!(reg.active().await.is_none());

        network.set_offline(false);
        let response = reg.fetch(&manifest()).await.unwrap();
        assert_eq!(response.body_bytes().as_ref(), b"shell /manifest.json");

        let err = reg.dispatch(Event::Push(None)).await.unwrap_err();
        assert!(matches!(err, WorkerError::NoActiveWorker("push")));
    }

    #[tokio::test]
    async fn unregister_retires_everything() {
        let reg = Registration::builder(online_network()).build();
        let v1 = reg.register(WorkerConfig::default()).await.unwrap();
        reg.unregister().await;
        assert_eq!(v1.state(), WorkerState::Redundant);
        assert!(reg.active().await.is_none());
    }
}
