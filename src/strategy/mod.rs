//! Strategy engine. Decides, per intercepted request, whether to answer from
//! cache, from the network, or both.
//!
//! | Class         | Strategy                                              | Store |
//! |---------------|-------------------------------------------------------|-------|
//! | `ApiData`     | network-first, cache fallback, lazy expiry, 503 JSON  | data  |
//! | `Navigation`  | network-first, offline shell document fallback        | any   |
//! | `StaticAsset` | cache-first (or stale-while-revalidate by extension)  | shell |
//!
//! Classification is evaluated in a fixed order and the first rule wins: the
//! API origin check, then the navigation mode check, then static asset. A
//! navigation to the API origin is therefore API data.
//!
//! Cache writes made while answering are fire-and-forget: they run on the
//! engine's [`TaskSet`] and never hold up the response.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::background::TaskSet;
use crate::cache::{Cache, CacheError, CacheStorage};
use crate::config::{ConfigError, WorkerConfig};
use crate::expiry::{self, Clock};
use crate::http::{Method, Request, RequestMode, Response, ResponseType, StatusCode};
use crate::network::{self, Network, NetworkError};

/// The class of an intercepted request, computed fresh for every request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestClass {
    ApiData,
    Navigation,
    StaticAsset,
}

impl RequestClass {
    /// Classifies `request` against the serialized API origin.
    ///
    /// ```
    /// use offcache::http::{Request, RequestMode};
    /// use offcache::strategy::RequestClass;
    ///
    /// let api = "https://story-api.dicoding.dev";
    /// let nav = Request::get("https://story-api.dicoding.dev/v1/stories")
    ///     .unwrap()
    ///     .mode(RequestMode::Navigate);
    /// assert_eq!(RequestClass::classify(&nav, api), RequestClass::ApiData);
    /// ```
    pub fn classify(request: &Request, api_origin: &str) -> Self {
        if request.origin() == api_origin {
            Self::ApiData
        } else if request.request_mode() == RequestMode::Navigate {
            Self::Navigation
        } else {
            Self::StaticAsset
        }
    }
}

impl fmt::Display for RequestClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ApiData => "api-data",
            Self::Navigation => "navigation",
            Self::StaticAsset => "static-asset",
        })
    }
}

/// Body of the synthesized offline response for API requests.
#[derive(Debug, Serialize)]
struct OfflineError {
    error: bool,
    message: &'static str,
    offline: bool,
}

/// Applies the per-class caching policy to intercepted requests.
pub struct StrategyEngine {
    config: Arc<WorkerConfig>,
    api_origin: String,
    caches: CacheStorage,
    network: Arc<dyn Network>,
    clock: Arc<dyn Clock>,
    tasks: TaskSet,
}

impl fmt::Debug for StrategyEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StrategyEngine")
            .field("api_origin", &self.api_origin)
            .field("shell_store", &self.config.shell_store())
            .field("data_store", &self.config.data_store())
            .finish_non_exhaustive()
    }
}

impl StrategyEngine {
    /// Builds an engine. Fails only if the configured API origin does not parse.
    pub fn new(
        config: Arc<WorkerConfig>,
        caches: CacheStorage,
        network: Arc<dyn Network>,
        clock: Arc<dyn Clock>,
        tasks: TaskSet,
    ) -> Result<Self, ConfigError> {
        let api_origin = config.api_origin_serialized()?;
        Ok(Self {
            config,
            api_origin,
            caches,
            network,
            clock,
            tasks,
        })
    }

    /// Classifies `request` against this engine's API origin.
    pub fn classify(&self, request: &Request) -> RequestClass {
        RequestClass::classify(request, &self.api_origin)
    }

    /// Answers an intercepted request.
    ///
    /// # Errors
    ///
    /// Returns the [`NetworkError`] where no fallback is defined: a
    /// failed non-GET API request, a static asset that is neither cached nor
    /// reachable, or a navigation with no cached shell document.
    pub async fn handle(&self, request: &Request) -> Result<Response, NetworkError> {
        let class = self.classify(request);
        debug!(url = %request.url(), method = %request.method(), class = %class, "intercepted fetch");
        match class {
            RequestClass::ApiData => self.network_first(request).await,
            RequestClass::Navigation => self.navigation(request).await,
            RequestClass::StaticAsset if self.should_revalidate(request) => {
                self.stale_while_revalidate(request).await
            }
            RequestClass::StaticAsset => self.cache_first(request).await,
        }
    }

    /// Network-first with cache fallback, for API data.
    pub async fn network_first(&self, request: &Request) -> Result<Response, NetworkError> {
        let store = match self.caches.open(&self.config.data_store()).await {
            Ok(store) => Some(store),
            Err(e) => {
                warn!(error = %e, "data store unavailable, passing through to network");
                None
            }
        };

        if let Some(store) = &store {
            expiry::sweep(
                store,
                self.config.data_max_age,
                self.config.max_data_entries,
                self.clock.as_ref(),
            )
            .await;
        }

        let is_get = request.method().is_cacheable();
        match network::fetch_with_timeout(
            self.network.as_ref(),
            request,
            self.config.network_timeout,
        )
        .await
        {
            Ok(response) => {
                if let Some(store) = store.filter(|_| is_get && response.is_ok()) {
                    self.store_api_response(store, request, &response);
                }
                Ok(response)
            }
            Err(e) if !is_get => Err(e),
            Err(e) => {
                if let Some(store) = &store {
                    if let Some(cached) = store.match_request(request).await {
                        info!(url = %request.url(), error = %e, "network failed, serving cached API response");
                        return Ok(cached);
                    }
                }
                warn!(url = %request.url(), error = %e, "network failed and nothing cached");
                Ok(offline_response())
            }
        }
    }

    /// Network-first with the offline shell document as fallback, for navigations.
    pub async fn navigation(&self, request: &Request) -> Result<Response, NetworkError> {
        let error = match self.network.fetch(request).await {
            Ok(response) => return Ok(response),
            Err(e) => e,
        };

        let fallback = match self.config.app_resource(&self.config.offline_fallback) {
            Ok(url) => Request::new(Method::Get, url),
            Err(e) => {
                warn!(error = %e, "offline fallback URL is invalid");
                return Err(error);
            }
        };

        match self.caches.match_request(&fallback).await {
            Some(shell) => {
                info!(url = %request.url(), fallback = %fallback.url(), "navigation offline, serving app shell");
                Ok(shell)
            }
            None => {
                warn!(url = %request.url(), error = %error, "navigation offline and app shell not cached");
                Err(error)
            }
        }
    }

    /// Cache-first with background population of the shell store, for static assets.
    pub async fn cache_first(&self, request: &Request) -> Result<Response, NetworkError> {
        let store = self.shell_store().await;
        if let Some(store) = &store {
            if let Some(cached) = store.match_request(request).await {
                debug!(url = %request.url(), "static asset served from cache");
                return Ok(cached);
            }
        }

        let response = self.network.fetch(request).await?;
        if let Some(store) = store.filter(|_| qualifies_for_shell(request, &response)) {
            self.store_in_background("cache-static-asset", store, request, response.clone());
        }
        Ok(response)
    }

    /// Stale-while-revalidate: answer from cache at once, refresh in the background.
    ///
    /// On a miss this behaves exactly like [`cache_first`](Self::cache_first).
    pub async fn stale_while_revalidate(
        &self,
        request: &Request,
    ) -> Result<Response, NetworkError> {
        let Some(store) = self.shell_store().await else {
            return self.network.fetch(request).await;
        };
        let Some(cached) = store.match_request(request).await else {
            return self.cache_first(request).await;
        };

        debug!(url = %request.url(), "serving cached asset while revalidating");
        let network = Arc::clone(&self.network);
        let request = request.clone();
        self.tasks.spawn("revalidate-static-asset", async move {
            let response = network.fetch(&request).await?;
            if qualifies_for_shell(&request, &response) {
                store.put(&request, &response).await.map_err(|e| NetworkError::Failed {
                    url: request.url().to_string(),
                    reason: e.to_string(),
                })?;
            }
            Ok::<(), NetworkError>(())
        });
        Ok(cached)
    }

    fn should_revalidate(&self, request: &Request) -> bool {
        if self.config.revalidate_extensions.is_empty() {
            return false;
        }
        let Some((_, ext)) = request.path().rsplit_once('.') else {
            return false;
        };
        self.config
            .revalidate_extensions
            .iter()
            .any(|e| e.trim_start_matches('.').eq_ignore_ascii_case(ext))
    }

    async fn shell_store(&self) -> Option<Cache> {
        match self.caches.open(&self.config.shell_store()).await {
            Ok(store) => Some(store),
            Err(e) => {
                warn!(error = %e, "shell store unavailable, passing through to network");
                None
            }
        }
    }

    /// Stamps and stores an API response in the background, then trims the
    /// store back to the entry cap so the new entry never overshoots it.
    fn store_api_response(&self, store: Cache, request: &Request, response: &Response) {
        let stamped = expiry::stamp(response, self.clock.now_millis());
        let request = request.clone();
        let max_age = self.config.data_max_age;
        let cap = self.config.max_data_entries;
        let clock = Arc::clone(&self.clock);
        self.tasks.spawn("cache-api-response", async move {
            store.put(&request, &stamped).await?;
            if cap.is_some() {
                expiry::sweep(&store, max_age, cap, clock.as_ref()).await;
            }
            Ok::<(), CacheError>(())
        });
    }

    fn store_in_background(
        &self,
        label: &'static str,
        store: Cache,
        request: &Request,
        response: Response,
    ) {
        let request = request.clone();
        self.tasks.spawn(label, async move {
            store.put(&request, &response).await
        });
    }
}

/// Only same-origin `200` responses to `GET` requests go into the shell store.
fn qualifies_for_shell(request: &Request, response: &Response) -> bool {
    request.method().is_cacheable()
        && response.status() == StatusCode::OK
        && response.response_type() == ResponseType::Basic
}

/// The structured error returned when an API request can be answered neither
/// by the network nor by the cache.
pub fn offline_response() -> Response {
    let body = OfflineError {
        error: true,
        message: "Network unavailable and no cached data for this request",
        offline: true,
    };
    match Response::json(StatusCode::SERVICE_UNAVAILABLE, &body) {
        Ok(response) => response,
        Err(_) => Response::new(StatusCode::SERVICE_UNAVAILABLE)
            .header("Content-Type", "application/json")
            .body(r#"{"error":true,"offline":true}"#),
    }
}
