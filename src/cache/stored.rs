//! On-disk representation of cache entries.

use serde::{Deserialize, Serialize};
use url::Url;

use super::CacheError;
use crate::http::{Headers, Method, Request, Response, ResponseType, StatusCode};

/// A serializable response snapshot: status, status text, headers, body and type.
///
/// Converting to and from [`Response`] is lossless apart from connection
/// handling, which is a property of the wire, not of the stored entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredResponse {
    pub status: StatusCode,
    pub status_text: String,
    pub headers: Headers,
    pub body: Vec<u8>,
    #[serde(rename = "type")]
    pub kind: ResponseType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl From<&Response> for StoredResponse {
    fn from(response: &Response) -> Self {
        Self {
            status: response.status(),
            status_text: response.status_text_str().to_owned(),
            headers: response.headers().clone(),
            body: response.body_bytes().to_vec(),
            kind: response.response_type(),
            url: response.response_url().map(|u| u.to_string()),
        }
    }
}

impl StoredResponse {
    /// Rebuilds a [`Response`] from the snapshot.
    pub fn into_response(self) -> Result<Response, CacheError> {
        let mut response = Response::new(self.status)
            .status_text(self.status_text)
            .with_headers(self.headers)
            .raw_body(self.body)
            .kind(self.kind);
        if let Some(url) = self.url {
            response = response.url(Url::parse(&url).map_err(|e| CacheError::Corrupt {
                reason: format!("bad response url {url:?}: {e}"),
            })?);
        }
        Ok(response)
    }
}

/// One request/response pair as written to a store file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct StoredEntry {
    pub method: String,
    pub url: String,
    pub response: StoredResponse,
}

impl StoredEntry {
    pub(crate) fn new(request: &Request, response: &Response) -> Self {
        Self {
            method: request.method().to_string(),
            url: request.url().to_string(),
            response: StoredResponse::from(response),
        }
    }

    pub(crate) fn into_parts(self) -> Result<(Request, Response), CacheError> {
        let Ok(method) = self.method.parse::<Method>();
        let url = Url::parse(&self.url).map_err(|e| CacheError::Corrupt {
            reason: format!("bad request url {:?}: {e}", self.url),
        })?;
        Ok((Request::new(method, url), self.response.into_response()?))
    }
}

/// The contents of one store file.
#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct StoredStore {
    pub name: String,
    pub entries: Vec<StoredEntry>,
}
