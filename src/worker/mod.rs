//! The worker: one object wiring the lifecycle controller, the strategy
//! engine and the notification bridge behind a single event dispatcher.
//!
//! ```rust,no_run
//! use offcache::config::WorkerConfig;
//! use offcache::http::{Request, RequestMode};
//! use offcache::worker::{Event, Worker};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let worker = Worker::builder(WorkerConfig::default()).build()?;
//! worker.dispatch(Event::Install).await?;
//! worker.dispatch(Event::Activate).await?;
//!
//! let page = Request::get("http://localhost:9000/")?.mode(RequestMode::Navigate);
//! let outcome = worker.dispatch(Event::Fetch(page)).await?;
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use thiserror::Error;
use tracing::debug;

use crate::background::TaskSet;
use crate::cache::{CacheError, CacheStorage};
use crate::clients::Clients;
use crate::config::{ConfigError, WorkerConfig, WorkerMode};
use crate::expiry::{Clock, SystemClock};
use crate::http::{Request, Response};
use crate::lifecycle::{Lifecycle, LifecycleError, WorkerState};
use crate::network::{HttpNetwork, Network, NetworkError};
use crate::notification::{
    self, ClickOutcome, Notification, NotificationError, Notifier, TracingNotifier,
};
use crate::strategy::StrategyEngine;

/// Everything that can go wrong while handling an event.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error(transparent)]
    Notification(#[from] NotificationError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("no active worker to handle {0}")]
    NoActiveWorker(&'static str),

    #[error("no installed worker is waiting to activate")]
    NoWaitingWorker,
}

/// An event delivered to the worker by its host.
#[derive(Debug, Clone)]
pub enum Event {
    Install,
    Activate,
    Fetch(Request),
    Push(Option<Bytes>),
    NotificationClick(Notification),
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Install => "install",
            Self::Activate => "activate",
            Self::Fetch(_) => "fetch",
            Self::Push(_) => "push",
            Self::NotificationClick(_) => "notificationclick",
        }
    }
}

/// What handling an event produced.
#[derive(Debug, Clone)]
pub enum EventOutcome {
    Installed,
    Activated { purged: Vec<String> },
    Response(Response),
    Notified(Notification),
    Clicked(ClickOutcome),
}

impl EventOutcome {
    /// The response of a fetch event, if this is one.
    pub fn into_response(self) -> Option<Response> {
        match self {
            Self::Response(response) => Some(response),
            _ => None,
        }
    }
}

/// Assembles a [`Worker`]. Anything not supplied gets a production default.
pub struct WorkerBuilder {
    config: WorkerConfig,
    caches: Option<CacheStorage>,
    network: Option<Arc<dyn Network>>,
    notifier: Option<Arc<dyn Notifier>>,
    clock: Option<Arc<dyn Clock>>,
    clients: Option<Clients>,
    tasks: Option<TaskSet>,
}

impl WorkerBuilder {
    /// Cache storage to use. Defaults to an in-memory one.
    #[must_use]
    pub fn caches(mut self, caches: CacheStorage) -> Self {
        self.caches = Some(caches);
        self
    }

    /// Network to use. Defaults to [`HttpNetwork`] for the app origin.
    #[must_use]
    pub fn network(mut self, network: Arc<dyn Network>) -> Self {
        self.network = Some(network);
        self
    }

    /// Notifier to use. Defaults to [`TracingNotifier`].
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

    /// Task set for background cache writes, shared with other workers of a registration.
    #[must_use]
    pub fn tasks(mut self, tasks: TaskSet) -> Self {
        self.tasks = Some(tasks);
        self
    }

    /// Validates the config and builds the worker in the `Parsed` state.
    pub fn build(self) -> Result<Worker, WorkerError> {
        self.config.validate()?;
        let config = Arc::new(self.config);

        let network: Arc<dyn Network> = match self.network {
            Some(network) => network,
            None => Arc::new(HttpNetwork::new(config.app_origin.clone())?),
        };
        let caches = self.caches.unwrap_or_else(CacheStorage::in_memory);
        let clients = self.clients.unwrap_or_default();
        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(SystemClock) as Arc<dyn Clock>);
        let notifier = self
            .notifier
            .unwrap_or_else(|| Arc::new(TracingNotifier) as Arc<dyn Notifier>);
        let tasks = self.tasks.unwrap_or_default();

        let engine = StrategyEngine::new(
            Arc::clone(&config),
            caches.clone(),
            Arc::clone(&network),
            Arc::clone(&clock),
            tasks.clone(),
        )?;
        let lifecycle = Lifecycle::new(
            Arc::clone(&config),
            caches.clone(),
            Arc::clone(&network),
            clients.clone(),
        );

        Ok(Worker {
            config,
            caches,
            network,
            clients,
            clock,
            notifier,
            tasks,
            engine,
            lifecycle,
        })
    }
}

/// A service worker instance: one version of the caching policy.
///
/// A host usually manages workers through a
/// [`Registration`](crate::registration::Registration), which keeps the
/// previous version serving while a new one installs.
pub struct Worker {
    config: Arc<WorkerConfig>,
    caches: CacheStorage,
    network: Arc<dyn Network>,
    clients: Clients,
    clock: Arc<dyn Clock>,
    notifier: Arc<dyn Notifier>,
    tasks: TaskSet,
    engine: StrategyEngine,
    lifecycle: Lifecycle,
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("state", &self.lifecycle.state())
            .field("epoch", &self.config.epoch)
            .field("mode", &self.config.mode)
            .field("engine", &self.engine)
            .finish_non_exhaustive()
    }
}

impl Worker {
    pub fn builder(config: WorkerConfig) -> WorkerBuilder {
        WorkerBuilder {
            config,
            caches: None,
            network: None,
            notifier: None,
            clock: None,
            clients: None,
            tasks: None,
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn state(&self) -> WorkerState {
        self.lifecycle.state()
    }

    /// Version epoch this worker caches under.
    pub fn epoch(&self) -> &str {
        &self.config.epoch
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    pub fn caches(&self) -> &CacheStorage {
        &self.caches
    }

    pub fn clients(&self) -> &Clients {
        &self.clients
    }

    /// Background cache writes started while answering fetches.
    pub fn tasks(&self) -> &TaskSet {
        &self.tasks
    }

    /// Handles one event. The event counts as resolved only once the returned
    /// future completes.
    pub fn dispatch(&self, event: Event) -> BoxFuture<'_, Result<EventOutcome, WorkerError>> {
        debug!(event = event.name(), state = %self.state(), "dispatching event");
        match event {
            Event::Install => Box::pin(async move {
                self.lifecycle.install().await?;
                Ok(EventOutcome::Installed)
            }),
            Event::Activate => Box::pin(async move {
                let purged = self.lifecycle.activate().await?;
                Ok(EventOutcome::Activated { purged })
            }),
            Event::Fetch(request) => Box::pin(async move {
                Ok(EventOutcome::Response(self.fetch(&request).await?))
            }),
            Event::Push(data) => Box::pin(async move {
                self.require_active("push")?;
                let shown = notification::on_push(
                    data.as_deref(),
                    &self.config,
                    self.notifier.as_ref(),
                    self.clock.as_ref(),
                )
                .await?;
                Ok(EventOutcome::Notified(shown))
            }),
            Event::NotificationClick(clicked) => Box::pin(async move {
                self.require_active("notificationclick")?;
                let outcome = notification::on_notification_click(
                    &clicked,
                    &self.config,
                    self.notifier.as_ref(),
                    &self.clients,
                )
                .await?;
                Ok(EventOutcome::Clicked(outcome))
            }),
        }
    }

    /// Answers a fetch. Until the worker is activated, and always in
    /// development mode, requests go straight to the network.
    pub async fn fetch(&self, request: &Request) -> Result<Response, WorkerError> {
        if !self.lifecycle.is_activated() || self.config.mode == WorkerMode::Development {
            debug!(url = %request.url(), "pass-through fetch");
            return Ok(self.network.fetch(request).await?);
        }
        Ok(self.engine.handle(request).await?)
    }

    fn require_active(&self, event: &'static str) -> Result<(), LifecycleError> {
        let actual = self.state();
        if actual == WorkerState::Activated {
            Ok(())
        } else {
            Err(LifecycleError::InvalidState {
                event,
                expected: WorkerState::Activated,
                actual,
            })
        }
    }
}
