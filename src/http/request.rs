//! Intercepted fetch requests.
//!
//! A [`Request`] is what the controlled page asked for: method, absolute URL,
//! request mode and body. Requests reach the worker either built directly by
//! the host or parsed off the wire by the proxy front-end using [`httparse`].

use std::fmt;

use bytes::Bytes;
use thiserror::Error;
use url::Url;

use super::{Headers, Method};

/// Errors that can occur while building or parsing a request.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("request is incomplete, more data needed")]
    Incomplete,

    #[error("HTTP parse error: {0}")]
    Parse(#[from] httparse::Error),

    #[error("missing required field: {field}")]
    MissingField { field: &'static str },

    #[error("invalid request URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

/// The fetch mode of a request, as reported by the page.
///
/// Only [`RequestMode::Navigate`] affects strategy selection; the rest are
/// carried through for completeness.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum RequestMode {
    /// A top-level document load.
    Navigate,
    SameOrigin,
    #[default]
    NoCors,
    Cors,
}

impl RequestMode {
    /// Maps a `Sec-Fetch-Mode` header value to a mode. Unknown values yield `None`.
    pub fn from_sec_fetch_mode(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "navigate" => Some(Self::Navigate),
            "same-origin" => Some(Self::SameOrigin),
            "no-cors" => Some(Self::NoCors),
            "cors" => Some(Self::Cors),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Navigate => "navigate",
            Self::SameOrigin => "same-origin",
            Self::NoCors => "no-cors",
            Self::Cors => "cors",
        }
    }
}

impl fmt::Display for RequestMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request intercepted from a controlled page.
///
/// # Examples
///
/// ```
/// use offcache::http::{Method, Request, RequestMode};
///
/// let request = Request::get("https://story-api.dicoding.dev/v1/stories?page=1")
///     .unwrap()
///     .mode(RequestMode::Cors);
///
/// assert_eq!(request.method(), &Method::Get);
/// assert_eq!(request.origin(), "https://story-api.dicoding.dev");
/// assert_eq!(request.cache_key(), "GET https://story-api.dicoding.dev/v1/stories?page=1");
/// ```
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    url: Url,
    mode: RequestMode,
    headers: Headers,
    body: Bytes,
    /// HTTP minor version when parsed off the wire: 0 for HTTP/1.0, 1 for HTTP/1.1.
    version: u8,
}

impl Request {
    /// Maximum number of headers we support per request.
    const MAX_HEADERS: usize = 64;

    /// Creates a request with an empty body and the default (`no-cors`) mode.
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            mode: RequestMode::default(),
            headers: Headers::new(),
            body: Bytes::new(),
            version: 1,
        }
    }

    /// Parses `url` and creates a `GET` request for it.
    pub fn get(url: &str) -> Result<Self, RequestError> {
        Ok(Self::new(Method::Get, Url::parse(url)?))
    }

    /// Parses `url` and creates a request with the given method.
    pub fn with_method(method: Method, url: &str) -> Result<Self, RequestError> {
        Ok(Self::new(method, Url::parse(url)?))
    }

    /// Sets the request mode.
    #[must_use]
    pub fn mode(mut self, mode: RequestMode) -> Self {
        self.mode = mode;
        self
    }

    /// Appends a request header.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Sets the request body.
    #[must_use]
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Parses an HTTP/1.1 request head arriving at the proxy front-end.
    ///
    /// The request target may be in absolute-form (`GET http://host/path`) or
    /// origin-form (`GET /path` plus a `Host` header, resolved with `scheme`).
    /// The mode comes from `Sec-Fetch-Mode`; without it, a request whose
    /// `Accept` header prefers `text/html` is treated as a navigation.
    ///
    /// Returns the request (with an empty body) and the byte offset at which
    /// the body begins in `buf`.
    ///
    /// # Errors
    ///
    /// - [`RequestError::Incomplete`]: more data is needed to complete the request headers.
    /// - [`RequestError::Parse`]: the data is malformed and cannot be parsed.
    /// - [`RequestError::MissingField`]: method, path, version or host is absent.
    /// - [`RequestError::InvalidUrl`]: the target does not form a valid URL.
    pub fn parse(buf: &[u8], scheme: &str) -> Result<(Self, usize), RequestError> {
        let mut headers = [httparse::EMPTY_HEADER; Self::MAX_HEADERS];
        let mut raw_req = httparse::Request::new(&mut headers);

        let body_offset = match raw_req.parse(buf)? {
            httparse::Status::Complete(offset) => offset,
            httparse::Status::Partial => return Err(RequestError::Incomplete),
        };

        let Ok(method) = raw_req
            .method
            .ok_or(RequestError::MissingField { field: "method" })?
            .parse::<Method>();

        let target = raw_req
            .path
            .ok_or(RequestError::MissingField { field: "path" })?;

        let version = raw_req
            .version
            .ok_or(RequestError::MissingField { field: "version" })?;

        let mut header_map = Headers::with_capacity(raw_req.headers.len());
        for header in raw_req.headers.iter() {
            if let Ok(value) = std::str::from_utf8(header.value) {
                header_map.insert(header.name, value);
            }
        }

        let url = if target.starts_with('/') {
            let host = header_map
                .get("host")
                .ok_or(RequestError::MissingField { field: "host" })?;
            Url::parse(&format!("{scheme}://{host}{target}"))?
        } else {
            Url::parse(target)?
        };

        let mode = header_map
            .get("sec-fetch-mode")
            .and_then(RequestMode::from_sec_fetch_mode)
            .unwrap_or_else(|| {
                let wants_html = header_map
                    .get("accept")
                    .is_some_and(|accept| accept.starts_with("text/html"));
                if wants_html && method == Method::Get {
                    RequestMode::Navigate
                } else {
                    RequestMode::NoCors
                }
            });

        Ok((
            Self {
                method,
                url,
                mode,
                headers: header_map,
                body: Bytes::new(),
                version,
            },
            body_offset,
        ))
    }

    /// Returns the HTTP method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Returns the absolute request URL.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Returns the request mode.
    pub fn request_mode(&self) -> RequestMode {
        self.mode
    }

    /// Returns the serialized origin of the request URL, e.g. `https://example.com`.
    pub fn origin(&self) -> String {
        self.url.origin().ascii_serialization()
    }

    /// Returns the URL path (without the query string).
    pub fn path(&self) -> &str {
        self.url.path()
    }

    /// Returns the request headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Returns the request body bytes.
    pub fn body_bytes(&self) -> &Bytes {
        &self.body
    }

    /// Replaces the body in place. Used once the proxy has buffered `Content-Length` bytes.
    pub fn set_body(&mut self, body: impl Into<Bytes>) {
        self.body = body.into();
    }

    /// The identity under which a response to this request is stored.
    ///
    /// Method plus the full URL with any fragment removed.
    pub fn cache_key(&self) -> String {
        let mut url = self.url.clone();
        url.set_fragment(None);
        format!("{} {}", self.method, url)
    }

    /// Returns `true` if the connection should be kept alive after this request.
    pub fn is_keep_alive(&self) -> bool {
        match self.headers.get("connection") {
            Some(conn) => conn.eq_ignore_ascii_case("keep-alive"),
            None => self.version == 1,
        }
    }

    /// Returns the value of the `Content-Length` header parsed as a `usize`, if present.
    pub fn content_length(&self) -> Option<usize> {
        self.headers.get("content-length")?.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_origin_form_uses_host() {
        let raw = b"GET /index.html HTTP/1.1\r\nHost: localhost:9000\r\n\r\n";
        let (req, offset) = Request::parse(raw, "http").unwrap();
        assert_eq!(req.method(), &Method::Get);
        assert_eq!(req.url().as_str(), "http://localhost:9000/index.html");
        assert_eq!(req.origin(), "http://localhost:9000");
        assert_eq!(offset, raw.len());
    }

    #[test]
    fn parse_absolute_form() {
        let raw = b"GET https://story-api.dicoding.dev/v1/stories?page=1 HTTP/1.1\r\nHost: x\r\n\r\n";
        let (req, _) = Request::parse(raw, "http").unwrap();
        assert_eq!(req.origin(), "https://story-api.dicoding.dev");
        assert_eq!(req.url().query(), Some("page=1"));
    }

    #[test]
    fn parse_reads_sec_fetch_mode() {
        let raw = b"GET / HTTP/1.1\r\nHost: localhost\r\nSec-Fetch-Mode: navigate\r\n\r\n";
        let (req, _) = Request::parse(raw, "http").unwrap();
        assert_eq!(req.request_mode(), RequestMode::Navigate);
    }

    #[test]
    fn parse_infers_navigation_from_accept() {
        let raw = b"GET /about HTTP/1.1\r\nHost: localhost\r\nAccept: text/html,*/*\r\n\r\n";
        let (req, _) = Request::parse(raw, "http").unwrap();
        assert_eq!(req.request_mode(), RequestMode::Navigate);

        let raw = b"GET /app.js HTTP/1.1\r\nHost: localhost\r\nAccept: */*\r\n\r\n";
        let (req, _) = Request::parse(raw, "http").unwrap();
        assert_eq!(req.request_mode(), RequestMode::NoCors);
    }

    #[test]
    fn parse_missing_host() {
        let raw = b"GET / HTTP/1.1\r\n\r\n";
        assert!(matches!(
            Request::parse(raw, "http"),
            Err(RequestError::MissingField { field: "host" })
        ));
    }

    #[test]
    fn incomplete_request() {
        let raw = b"GET / HTTP/1.1\r\nHost:";
        assert!(matches!(
            Request::parse(raw, "http"),
            Err(RequestError::Incomplete)
        ));
    }

    #[test]
    fn connection_close() {
        let raw = b"GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n";
        let (req, _) = Request::parse(raw, "http").unwrap();
        assert!(!req.is_keep_alive());
    }

    #[test]
    fn content_length_and_body_offset() {
        let raw = b"POST /v1/stories HTTP/1.1\r\nHost: localhost\r\nContent-Length: 5\r\n\r\nhello";
        let (req, body_offset) = Request::parse(raw, "http").unwrap();
        assert_eq!(req.content_length(), Some(5));
        assert_eq!(&raw[body_offset..], b"hello");
    }

    #[test]
    fn cache_key_drops_fragment() {
        let req = Request::get("https://example.com/a?b=1#top").unwrap();
        assert_eq!(req.cache_key(), "GET https://example.com/a?b=1");
    }
}
