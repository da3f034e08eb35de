//! How the worker reaches the real network.
//!
//! Strategies only ever talk to a [`Network`], so they can be driven by
//! [`HttpNetwork`] in production and by a scripted double in tests.

use std::time::Duration;

use futures::future::BoxFuture;
use thiserror::Error;
use tracing::debug;

use crate::http::{Headers, Request, RequestMode, Response, ResponseType, StatusCode};

#[cfg(test)]
pub(crate) mod mock;

/// Errors produced while fetching from the network.
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("network request to {url} failed: {reason}")]
    Failed { url: String, reason: String },

    #[error("network request to {url} timed out after {after:?}")]
    Timeout { url: String, after: Duration },

    #[error("HTTP client error: {0}")]
    Client(#[from] reqwest::Error),

    #[error("upstream returned invalid status {0}")]
    InvalidStatus(u16),
}

/// Anything that can turn a [`Request`] into a [`Response`].
///
/// A returned `Ok` is any HTTP response, including error statuses; `Err`
/// means no response arrived at all.
pub trait Network: Send + Sync {
    fn fetch<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<Response, NetworkError>>;
}

/// Runs `network.fetch(request)`, giving up after `timeout` when one is set.
pub async fn fetch_with_timeout(
    network: &dyn Network,
    request: &Request,
    timeout: Option<Duration>,
) -> Result<Response, NetworkError> {
    match timeout {
        None => network.fetch(request).await,
        Some(after) => match tokio::time::timeout(after, network.fetch(request)).await {
            Ok(result) => result,
            Err(_) => Err(NetworkError::Timeout {
                url: request.url().to_string(),
                after,
            }),
        },
    }
}

// Recomputed by the client for the upstream connection.
const CLIENT_MANAGED: &[&str] = &["host", "content-length"];

/// A [`Network`] backed by a [`reqwest::Client`].
///
/// Response types are derived the way a browser would for a page on
/// `client_origin`: same-origin responses are `basic`, cross-origin `no-cors`
/// responses are `opaque`, everything else is `cors`.
#[derive(Debug, Clone)]
pub struct HttpNetwork {
    client: reqwest::Client,
    client_origin: String,
}

impl HttpNetwork {
    /// Builds a network with a default client.
    pub fn new(client_origin: impl Into<String>) -> Result<Self, NetworkError> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self::with_client(client, client_origin))
    }

    /// Wraps an existing client.
    pub fn with_client(client: reqwest::Client, client_origin: impl Into<String>) -> Self {
        Self {
            client,
            client_origin: client_origin.into(),
        }
    }

    fn response_type(&self, request: &Request) -> ResponseType {
        if request.origin() == self.client_origin {
            ResponseType::Basic
        } else if request.request_mode() == RequestMode::NoCors {
            ResponseType::Opaque
        } else {
            ResponseType::Cors
        }
    }

    async fn send(&self, request: &Request) -> Result<Response, NetworkError> {
        let method = reqwest::Method::from_bytes(request.method().as_str().as_bytes()).map_err(|e| {
            NetworkError::Failed {
                url: request.url().to_string(),
                reason: e.to_string(),
            }
        })?;

        let mut outbound = request.headers().clone();
        outbound.strip_hop_by_hop();
        let mut builder = self.client.request(method, request.url().clone());
        for (name, value) in outbound.iter() {
            if !CLIENT_MANAGED.iter().any(|h| name.eq_ignore_ascii_case(h)) {
                builder = builder.header(name, value);
            }
        }
        if !request.body_bytes().is_empty() {
            builder = builder.body(request.body_bytes().clone());
        }

        let upstream = builder.send().await?;
        let code = upstream.status().as_u16();
        let status = StatusCode::from_u16(code).ok_or(NetworkError::InvalidStatus(code))?;
        let status_text = upstream
            .status()
            .canonical_reason()
            .unwrap_or_default()
            .to_owned();

        let mut headers: Headers = upstream
            .headers()
            .iter()
            .filter_map(|(name, value)| Some((name.as_str(), value.to_str().ok()?)))
            .collect();
        headers.strip_hop_by_hop();
        let final_url = upstream.url().clone();
        let body = upstream.bytes().await?;

        debug!(url = %request.url(), status = code, bytes = body.len(), "network response");
        Ok(Response::new(status)
            .status_text(status_text)
            .with_headers(headers)
            .raw_body(body)
            .kind(self.response_type(request))
            .url(final_url))
    }
}

impl Network for HttpNetwork {
    fn fetch<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<Response, NetworkError>> {
        Box::pin(self.send(request))
    }
}
