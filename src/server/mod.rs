//! Proxy front-end: an async HTTP/1.1 listener that turns every request it
//! reads into a fetch event for the active worker of a [`Registration`].
//!
//! Clients may use it as a forward proxy (absolute-form targets) or address
//! it as the app origin (origin-form targets plus `Host`). Connections stay
//! open between requests unless the client sends `Connection: close`, and
//! pipelined requests are answered in order.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::http::{Request, RequestError, Response, StatusCode};
use crate::network::NetworkError;
use crate::registration::Registration;
use crate::worker::WorkerError;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
}

/// Largest request (head plus body) buffered before answering `413`.
const MAX_REQUEST_SIZE: usize = 8 * 1024 * 1024;

const INITIAL_BUF_SIZE: usize = 4096;

/// A bound, not yet serving, proxy listener.
#[derive(Debug)]
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    scheme: &'static str,
}

impl Server {
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the address cannot be bound.
    pub async fn bind(addr: impl AsRef<str>) -> Result<Self, ServerError> {
        let addr = addr.as_ref();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: addr.to_owned(),
                source,
            })?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
            scheme: "http",
        })
    }

    /// Scheme assumed for origin-form targets, e.g. `https` behind a TLS terminator.
    #[must_use]
    pub fn scheme(mut self, scheme: &'static str) -> Self {
        self.scheme = scheme;
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serves `registration` until the process ends.
    pub async fn serve(self, registration: Arc<Registration>) -> Result<(), ServerError> {
        self.serve_until(registration, std::future::pending()).await
    }

    /// Serves `registration` until `shutdown` resolves, then stops accepting
    /// and waits for pending background cache writes.
    ///
    /// Connections already accepted keep running on their own tasks.
    pub async fn serve_until(
        self,
        registration: Arc<Registration>,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), ServerError> {
        info!(address = %self.local_addr, "offcache proxy listening");
        tokio::pin!(shutdown);

        loop {
            let (stream, peer) = tokio::select! {
                () = &mut shutdown => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        error!(error = %e, "failed to accept connection");
                        continue;
                    }
                },
            };

            debug!(peer = %peer, "connection accepted");
            let registration = Arc::clone(&registration);
            let conn = Connection::new(stream, peer, self.scheme);
            tokio::spawn(async move {
                if let Err(e) = conn.run(&registration).await {
                    warn!(peer = %peer, error = %e, "connection closed with error");
                }
            });
        }

        info!("proxy shutting down, draining background writes");
        registration.tasks().drain().await;
        Ok(())
    }
}

/// Answers one fetch on behalf of the proxy.
///
/// A fetch that fails with no fallback surfaces as `502 Bad Gateway`, or
/// `504 Gateway Timeout` when the network wait ran out.
pub async fn respond(registration: &Registration, request: &Request) -> Response {
    match registration.fetch(request).await {
        Ok(response) => response,
        Err(e) => {
            let status = match &e {
                WorkerError::Network(NetworkError::Timeout { .. }) => StatusCode::GATEWAY_TIMEOUT,
                _ => StatusCode::BAD_GATEWAY,
            };
            warn!(url = %request.url(), status = status.as_u16(), error = %e, "fetch failed");
            Response::new(status).body(format!("{status}: {e}"))
        }
    }
}

/// What the next read on a connection produced.
enum Incoming {
    Request(Request),
    /// The client sent something unanswerable; reply and hang up.
    Reject(Response),
    Closed,
}

struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    scheme: &'static str,
    buf: BytesMut,
}

impl Connection {
    fn new(stream: TcpStream, peer: SocketAddr, scheme: &'static str) -> Self {
        Self {
            stream,
            peer,
            scheme,
            buf: BytesMut::with_capacity(INITIAL_BUF_SIZE),
        }
    }

    async fn run(mut self, registration: &Registration) -> io::Result<()> {
        loop {
            let request = match self.next_request().await? {
                Incoming::Request(request) => request,
                Incoming::Reject(response) => return self.send(response.keep_alive(false)).await,
                Incoming::Closed => {
                    debug!(peer = %self.peer, "connection closed by peer");
                    return Ok(());
                }
            };

            let keep_alive = request.is_keep_alive();
            debug!(
                peer = %self.peer,
                method = %request.method(),
                url = %request.url(),
                mode = request.request_mode().as_str(),
                "dispatching fetch"
            );
            let response = respond(registration, &request).await;
            self.send(response.keep_alive(keep_alive)).await?;

            if !keep_alive {
                return Ok(());
            }
        }
    }

    /// Reads until one complete request (head and `Content-Length` body) is buffered.
    async fn next_request(&mut self) -> io::Result<Incoming> {
        loop {
            if !self.buf.is_empty() {
                if self.buf.len() > MAX_REQUEST_SIZE {
                    warn!(peer = %self.peer, bytes = self.buf.len(), "request too large");
                    return Ok(Incoming::Reject(too_large()));
                }

                match Request::parse(&self.buf, self.scheme) {
                    Ok((mut request, head_len)) => {
                        let declared = request.content_length().unwrap_or(0);
                        let Some(total) = head_len
                            .checked_add(declared)
                            .filter(|total| *total <= MAX_REQUEST_SIZE)
                        else {
                            warn!(peer = %self.peer, content_length = declared, "declared body too large");
                            return Ok(Incoming::Reject(too_large()));
                        };
                        if self.buf.len() >= total {
                            let body = self.buf.split_to(total).split_off(head_len).freeze();
                            request.set_body(body);
                            return Ok(Incoming::Request(request));
                        }
                    }
                    Err(RequestError::Incomplete) => {}
                    Err(e) => {
                        warn!(peer = %self.peer, error = %e, "bad request");
                        return Ok(Incoming::Reject(
                            Response::new(StatusCode::BAD_REQUEST).body(format!("Bad Request: {e}")),
                        ));
                    }
                }
            }

            if self.stream.read_buf(&mut self.buf).await? == 0 {
                return Ok(Incoming::Closed);
            }
        }
    }

    async fn send(&mut self, response: Response) -> io::Result<()> {
        self.stream.write_all(&response.into_bytes()).await?;
        self.stream.flush().await
    }
}

fn too_large() -> Response {
    Response::new(StatusCode::PAYLOAD_TOO_LARGE).body("Request entity too large")
}
