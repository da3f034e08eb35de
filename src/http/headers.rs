//! Ordered, case-insensitive header list shared by requests, responses and
//! stored cache entries.

use serde::{Deserialize, Serialize};

/// Connection-scoped headers. They describe one hop and never travel with a
/// request to the upstream or with a response into the cache.
pub const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authorization",
    "transfer-encoding",
    "upgrade",
    "te",
    "trailer",
];

/// Header fields in arrival order. Names compare ASCII case-insensitively and
/// a name may repeat.
///
/// On disk a list is a JSON array of `[name, value]` pairs, so a cached
/// response is replayed with its headers in the order the origin sent them.
///
/// ```
/// use offcache::http::Headers;
///
/// let mut headers: Headers = [("Content-Type", "application/json"), ("Connection", "close")]
///     .into_iter()
///     .collect();
/// headers.set("content-type", "text/html");
/// headers.strip_hop_by_hop();
///
/// assert_eq!(headers.get("Content-Type"), Some("text/html"));
/// assert_eq!(headers.len(), 1);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Headers {
    fields: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            fields: Vec::with_capacity(capacity),
        }
    }

    /// Adds a field after the existing ones, keeping earlier values of the same name.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.fields.push((name.into(), value.into()));
    }

    /// Leaves exactly one field called `name`, holding `value`.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.remove(&name);
        self.fields.push((name, value.into()));
    }

    /// First value of `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.get_all(name).next()
    }

    /// Every value of `name`, oldest first.
    pub fn get_all<'a, 'n>(&'a self, name: &'n str) -> impl Iterator<Item = &'a str> + use<'a, 'n> {
        self.fields
            .iter()
            .filter(move |(field, _)| field.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Drops every field called `name`. Returns `true` if there was one.
    pub fn remove(&mut self, name: &str) -> bool {
        let had = self.fields.len();
        self.fields.retain(|(field, _)| !field.eq_ignore_ascii_case(name));
        self.fields.len() != had
    }

    /// Drops the [`HOP_BY_HOP`] fields.
    pub fn strip_hop_by_hop(&mut self) {
        self.fields
            .retain(|(field, _)| !HOP_BY_HOP.iter().any(|h| field.eq_ignore_ascii_case(h)));
    }

    /// Number of fields, counting repeats.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }
}

impl<N, V> FromIterator<(N, V)> for Headers
where
    N: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
        Self {
            fields: iter
                .into_iter()
                .map(|(name, value)| (name.into(), value.into()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_ignores_case_and_keeps_repeats() {
        let headers: Headers = [("Vary", "Accept"), ("vary", "Origin")].into_iter().collect();
        assert_eq!(headers.get("VARY"), Some("Accept"));
        assert_eq!(headers.get_all("Vary").collect::<Vec<_>>(), ["Accept", "Origin"]);
        assert!(headers.contains("vary"));
        assert!(!headers.contains("etag"));
    }

    #[test]
    fn lookup_name_can_be_a_temporary() {
        let headers: Headers = [("Content-Length", "11")].into_iter().collect();
        let name = String::from("content-length");
        let value = headers.get(&name);
        drop(name);
        assert_eq!(value, Some("11"));
    }

    #[test]
    fn set_collapses_repeats() {
        let mut headers: Headers = [("X-Offcache-Cached-At", "1"), ("x-offcache-cached-at", "2")]
            .into_iter()
            .collect();
        headers.set("x-offcache-cached-at", "3");
        assert_eq!(headers.get_all("X-Offcache-Cached-At").collect::<Vec<_>>(), ["3"]);
        assert!(headers.remove("x-offcache-cached-at"));
        assert!(!headers.remove("x-offcache-cached-at"));
        assert!(headers.is_empty());
    }

    #[test]
    fn hop_by_hop_fields_are_stripped() {
        let mut headers: Headers = [
            ("Keep-Alive", "timeout=5"),
            ("Cache-Control", "max-age=60"),
            ("Transfer-Encoding", "chunked"),
            ("Connection", "keep-alive"),
        ]
        .into_iter()
        .collect();
        headers.strip_hop_by_hop();
        assert_eq!(headers.iter().collect::<Vec<_>>(), [("Cache-Control", "max-age=60")]);
    }

    #[test]
    fn json_is_an_ordered_pair_list() {
        let headers: Headers = [("ETag", "\"v2\""), ("Content-Type", "text/css")].into_iter().collect();
        let json = serde_json::to_string(&headers).unwrap();
        assert_eq!(json, r#"[["ETag","\"v2\""],["Content-Type","text/css"]]"#);
        assert_eq!(serde_json::from_str::<Headers>(&json).unwrap(), headers);
    }
}
