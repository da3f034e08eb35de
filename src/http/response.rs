//! Response snapshots.
//!
//! A [`Response`] owns its body as an immutable [`Bytes`] buffer, read exactly
//! once from wherever it came from (network, cache, or a handler). Cloning a
//! response therefore yields an independent view over the same buffer, which
//! is how the strategies return a response to the page and persist it at the
//! same time.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use url::Url;

use super::{Headers, StatusCode};

/// Where a response came from, in fetch terms.
///
/// Only `Basic` (same-origin) responses qualify for the static-asset cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseType {
    #[default]
    Basic,
    Cors,
    Opaque,
    Error,
}

/// An HTTP response snapshot.
///
/// # Examples
///
/// ```
/// use offcache::http::{Response, StatusCode};
///
/// let response = Response::new(StatusCode::OK)
///     .header("Content-Type", "application/json")
///     .body(r#"{"status":"ok"}"#);
///
/// let copy = response.clone();
/// assert_eq!(copy.body_bytes(), response.body_bytes());
///
/// let bytes = response.into_bytes();
/// let text = std::str::from_utf8(&bytes).unwrap();
/// assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
/// assert!(text.contains("Content-Length: 15\r\n"));
/// ```
#[derive(Debug, Clone)]
pub struct Response {
    status: StatusCode,
    status_text: String,
    headers: Headers,
    body: Bytes,
    kind: ResponseType,
    url: Option<Url>,
    keep_alive: bool,
}

impl Response {
    /// Creates a new response with the given status, its canonical status text and an empty body.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            status_text: status.canonical_reason().unwrap_or_default().to_owned(),
            headers: Headers::new(),
            body: Bytes::new(),
            kind: ResponseType::Basic,
            url: None,
            keep_alive: true,
        }
    }

    /// Builds a response with a JSON body and `Content-Type: application/json`.
    pub fn json<T: Serialize>(status: StatusCode, value: &T) -> Result<Self, serde_json::Error> {
        let body = serde_json::to_vec(value)?;
        Ok(Self::new(status)
            .header("Content-Type", "application/json")
            .raw_body(body))
    }

    /// Appends a response header. Multiple calls with the same name are additive.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Appends a header in-place.
    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(name, value);
    }

    /// Sets the response body from a string.
    #[must_use]
    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = Bytes::from(body.into());
        self
    }

    /// Sets the response body from raw bytes.
    #[must_use]
    pub fn raw_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Overrides the status text.
    #[must_use]
    pub fn status_text(mut self, text: impl Into<String>) -> Self {
        self.status_text = text.into();
        self
    }

    /// Sets the response type.
    #[must_use]
    pub fn kind(mut self, kind: ResponseType) -> Self {
        self.kind = kind;
        self
    }

    /// Records the final URL the response was served from.
    #[must_use]
    pub fn url(mut self, url: Url) -> Self {
        self.url = Some(url);
        self
    }

    /// Replaces the header map wholesale.
    #[must_use]
    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    /// Controls whether the `Connection: keep-alive` or `Connection: close` header is written.
    #[must_use]
    pub fn keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Returns the status code of this response.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Returns `true` for `2xx` statuses.
    pub fn is_ok(&self) -> bool {
        self.status.is_success()
    }

    pub fn status_text_str(&self) -> &str {
        &self.status_text
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    /// Returns the body buffer. Cloning it is cheap; the bytes are shared.
    pub fn body_bytes(&self) -> &Bytes {
        &self.body
    }

    pub fn response_type(&self) -> ResponseType {
        self.kind
    }

    pub fn response_url(&self) -> Option<&Url> {
        self.url.as_ref()
    }

    /// Serializes the response into a `BytesMut` buffer using HTTP/1.1 wire format.
    ///
    /// Framing headers carried over from upstream or from the cache
    /// (`Content-Length`, `Transfer-Encoding`, `Connection`) are dropped and
    /// rewritten, since the body here is always a complete buffer.
    pub fn into_bytes(mut self) -> BytesMut {
        let content_length = self.body.len();

        self.headers.remove("content-length");
        self.headers.strip_hop_by_hop();

        if !self.body.is_empty() && !self.headers.contains("content-type") {
            self.headers
                .insert("Content-Type", "text/plain; charset=utf-8");
        }

        let connection = if self.keep_alive {
            "keep-alive"
        } else {
            "close"
        };
        self.headers.set("Connection", connection);

        let estimated_size = 128 + self.headers.len() * 64 + content_length;
        let mut buf = BytesMut::with_capacity(estimated_size);

        buf.put(
            format!(
                "HTTP/1.1 {} {}\r\n",
                self.status.as_u16(),
                self.status_text
            )
            .as_bytes(),
        );

        for (name, value) in self.headers.iter() {
            buf.put(format!("{name}: {value}\r\n").as_bytes());
        }

        // Content-Length is always the last header before the blank line
        buf.put(format!("Content-Length: {content_length}\r\n").as_bytes());
        buf.put(&b"\r\n"[..]);

        if !self.body.is_empty() {
            buf.put(self.body);
        }

        buf
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new(StatusCode::OK)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn to_string(bytes: BytesMut) -> String {
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn simple_ok_response() {
        let r = Response::new(StatusCode::OK).body("Hello");
        let s = to_string(r.into_bytes());
        assert!(s.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(s.contains("Content-Length: 5\r\n"));
        assert!(s.ends_with("\r\n\r\nHello"));
    }

    #[test]
    fn upstream_framing_headers_are_rewritten() {
        let r = Response::new(StatusCode::OK)
            .header("Content-Length", "999")
            .header("Transfer-Encoding", "chunked")
            .header("Connection", "close")
            .body("ok");
        let s = to_string(r.into_bytes());
        assert!(!s.contains("999"));
        assert!(!s.contains("chunked"));
        assert!(s.contains("Connection: keep-alive\r\n"));
        assert!(s.contains("Content-Length: 2\r\n"));
    }

    #[test]
    fn custom_status_text_is_written() {
        let r = Response::new(StatusCode::from_u16(299).unwrap()).status_text("Fine");
        let s = to_string(r.into_bytes());
        assert!(s.starts_with("HTTP/1.1 299 Fine\r\n"));
    }

    #[test]
    fn json_sets_content_type() {
        let r = Response::json(StatusCode::SERVICE_UNAVAILABLE, &serde_json::json!({"error": true}))
            .unwrap();
        assert_eq!(r.headers().get("content-type"), Some("application/json"));
        assert_eq!(r.body_bytes().as_ref(), br#"{"error":true}"#);
    }

    #[test]
    fn clone_shares_body() {
        let r = Response::new(StatusCode::OK).raw_body(vec![1u8; 1024]);
        let copy = r.clone();
        assert_eq!(r.body_bytes().as_ptr(), copy.body_bytes().as_ptr());
    }

    #[test]
    fn connection_close() {
        let r = Response::new(StatusCode::OK).keep_alive(false);
        let s = to_string(r.into_bytes());
        assert!(s.contains("Connection: close\r\n"));
    }
}
