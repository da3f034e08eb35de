//! Scripted network double for tests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use futures::future::BoxFuture;

use super::{Network, NetworkError};
use crate::http::{Request, Response, StatusCode};

/// Serves canned responses by URL and records every fetch.
///
/// Unknown URLs answer `404`; while offline every fetch fails.
#[derive(Debug, Default)]
pub(crate) struct MockNetwork {
    routes: Mutex<HashMap<String, Response>>,
    seen: Mutex<Vec<Request>>,
    offline: AtomicBool,
    calls: AtomicUsize,
    delay: Option<Duration>,
}

impl MockNetwork {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub(crate) fn route(&self, url: &str, response: Response) {
        self.routes.lock().unwrap().insert(url.to_owned(), response);
    }

    pub(crate) fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Every request fetched so far, oldest first.
    pub(crate) fn seen(&self) -> Vec<Request> {
        self.seen.lock().unwrap().clone()
    }
}

impl Network for MockNetwork {
    fn fetch<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<Response, NetworkError>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(request.clone());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.offline.load(Ordering::SeqCst) {
                return Err(NetworkError::Failed {
                    url: request.url().to_string(),
                    reason: "offline".to_owned(),
                });
            }
            let routed = self.routes.lock().unwrap().get(request.url().as_str()).cloned();
            Ok(routed.unwrap_or_else(|| Response::new(StatusCode::NOT_FOUND)))
        })
    }
}
