//! Expiry policy for API data entries.
//!
//! Entries are stamped with a `x-offcache-cached-at` header (milliseconds
//! since the Unix epoch) on their way into the data store. Expiry is lazy:
//! [`sweep`] runs right before an API request is served, so an expired entry
//! is only guaranteed gone once its store is touched again.
//!
//! An entry is expired when `now - cached_at > max_age`; at exactly
//! `cached_at + max_age` it is still fresh. Entries without a readable marker
//! are never expired.

use std::time::Duration;

use tracing::{debug, warn};

use crate::cache::Cache;
use crate::http::Response;

/// Header carrying the time an API response was stored.
pub const CACHED_AT_HEADER: &str = "x-offcache-cached-at";

/// Source of wall-clock time, in milliseconds since the Unix epoch.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> i64;
}

/// The real clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Returns a copy of `response` stamped with `now`.
///
/// Status, status text, type, headers and body are preserved; an existing
/// marker is replaced.
pub fn stamp(response: &Response, now: i64) -> Response {
    let mut stamped = response.clone();
    stamped
        .headers_mut()
        .set(CACHED_AT_HEADER, now.to_string());
    stamped
}

/// Reads the stamp off a response, if it has a valid one.
pub fn cached_at(response: &Response) -> Option<i64> {
    response.headers().get(CACHED_AT_HEADER)?.trim().parse().ok()
}

/// Returns `true` when `response` was stamped more than `max_age` before `now`.
pub fn is_expired(response: &Response, max_age: Duration, now: i64) -> bool {
    let Some(stamped) = cached_at(response) else {
        return false;
    };
    let max_age = i64::try_from(max_age.as_millis()).unwrap_or(i64::MAX);
    now.saturating_sub(stamped) > max_age
}

/// Deletes every expired entry in `cache`, then trims it to `max_entries`
/// (oldest stamps first) when a cap is given. Returns the number removed.
///
/// Failures to delete a single entry are logged and skipped.
pub async fn sweep(
    cache: &Cache,
    max_age: Duration,
    max_entries: Option<usize>,
    clock: &dyn Clock,
) -> usize {
    let now = clock.now_millis();
    let mut removed = 0;
    let mut survivors = Vec::new();

    for (request, response) in cache.entries().await {
        if is_expired(&response, max_age, now) {
            match cache.delete(&request).await {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(e) => warn!(store = %cache.name(), url = %request.url(), error = %e, "failed to evict expired entry"),
            }
        } else {
            survivors.push((cached_at(&response).unwrap_or(i64::MAX), request));
        }
    }

    if let Some(max) = max_entries {
        if survivors.len() > max {
            survivors.sort_by_key(|(stamped, _)| *stamped);
            let excess = survivors.len() - max;
            for (_, request) in survivors.into_iter().take(excess) {
                match cache.delete(&request).await {
                    Ok(true) => removed += 1,
                    Ok(false) => {}
                    Err(e) => warn!(store = %cache.name(), url = %request.url(), error = %e, "failed to evict entry over cap"),
                }
            }
        }
    }

    if removed > 0 {
        debug!(store = %cache.name(), removed, "swept cache store");
    }
    removed
}
