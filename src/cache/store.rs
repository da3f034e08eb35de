//! A single named cache store.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use super::CacheError;
use super::stored::{StoredEntry, StoredStore};
use crate::http::{Request, Response};

#[derive(Debug, Clone)]
struct Entry {
    request: Request,
    response: Response,
}

#[derive(Debug)]
struct Shared {
    name: String,
    entries: RwLock<BTreeMap<String, Entry>>,
    /// Backing file, for persistent storage.
    file: Option<PathBuf>,
    /// Serialises file writes so the last snapshot taken is the last one written.
    write_lock: Mutex<()>,
    /// Set once the store is deleted from its registry; handles keep working
    /// in memory but never touch the file again.
    detached: AtomicBool,
}

/// Handle to a named store mapping request identity to a response snapshot.
///
/// Handles are cheap to clone and every clone (and every handle obtained by
/// re-opening the same name) sees the same entries. Conflicting writes to one
/// key are serialised by the store's lock; the last write wins.
#[derive(Debug, Clone)]
pub struct Cache {
    shared: Arc<Shared>,
}

impl Cache {
    pub(crate) fn new(name: &str, file: Option<PathBuf>) -> Self {
        Self::with_entries(name, file, BTreeMap::new())
    }

    fn with_entries(name: &str, file: Option<PathBuf>, entries: BTreeMap<String, Entry>) -> Self {
        Self {
            shared: Arc::new(Shared {
                name: name.to_owned(),
                entries: RwLock::new(entries),
                file,
                write_lock: Mutex::new(()),
                detached: AtomicBool::new(false),
            }),
        }
    }

    pub(crate) fn from_stored(stored: StoredStore, file: PathBuf) -> Self {
        let mut entries = BTreeMap::new();
        for entry in stored.entries {
            match entry.into_parts() {
                Ok((request, response)) => {
                    entries.insert(request.cache_key(), Entry { request, response });
                }
                Err(e) => {
                    tracing::warn!(store = %stored.name, error = %e, "skipping unreadable cache entry");
                }
            }
        }
        Self::with_entries(&stored.name, Some(file), entries)
    }

    /// Returns the store name.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Stores `response` under the identity of `request`, replacing any previous entry.
    ///
    /// # Errors
    ///
    /// [`CacheError::MethodNotCacheable`] for anything but `GET`, or an I/O
    /// error if a persistent store could not write its file. On error the
    /// store is left as it was.
    pub async fn put(&self, request: &Request, response: &Response) -> Result<(), CacheError> {
        self.put_all(&[(request.clone(), response.clone())]).await
    }

    /// Stores every pair, or none of them.
    ///
    /// The pairs become visible together and are written to disk in one
    /// snapshot. If that write fails, every replaced entry is restored.
    pub async fn put_all(&self, pairs: &[(Request, Response)]) -> Result<(), CacheError> {
        if let Some((request, _)) = pairs.iter().find(|(r, _)| !r.method().is_cacheable()) {
            return Err(CacheError::MethodNotCacheable(request.method().to_string()));
        }

        let _guard = self.shared.write_lock.lock().await;
        let mut replaced = Vec::with_capacity(pairs.len());
        {
            let mut entries = self.shared.entries.write().await;
            for (request, response) in pairs {
                let key = request.cache_key();
                debug!(store = %self.name(), key = %key, "cache put");
                let previous = entries.insert(
                    key.clone(),
                    Entry {
                        request: request.clone(),
                        response: response.clone(),
                    },
                );
                replaced.push((key, previous));
            }
        }

        if let Err(e) = self.write_file().await {
            let mut entries = self.shared.entries.write().await;
            for (key, previous) in replaced.into_iter().rev() {
                match previous {
                    Some(entry) => entries.insert(key, entry),
                    None => entries.remove(&key),
                };
            }
            warn!(store = %self.name(), error = %e, "cache write failed, rolled back");
            return Err(e);
        }
        Ok(())
    }

    /// Returns the stored response for `request`, if any.
    pub async fn match_request(&self, request: &Request) -> Option<Response> {
        self.shared
            .entries
            .read()
            .await
            .get(&request.cache_key())
            .map(|entry| entry.response.clone())
    }

    /// Removes the entry for `request`. Returns `true` if one existed.
    pub async fn delete(&self, request: &Request) -> Result<bool, CacheError> {
        let _guard = self.shared.write_lock.lock().await;
        let key = request.cache_key();
        let Some(removed) = self.shared.entries.write().await.remove(&key) else {
            return Ok(false);
        };
        if let Err(e) = self.write_file().await {
            self.shared.entries.write().await.insert(key, removed);
            return Err(e);
        }
        Ok(true)
    }

    /// Returns every stored request, ordered by identity.
    pub async fn keys(&self) -> Vec<Request> {
        self.shared
            .entries
            .read()
            .await
            .values()
            .map(|entry| entry.request.clone())
            .collect()
    }

    /// Returns every stored request/response pair, ordered by identity.
    pub async fn entries(&self) -> Vec<(Request, Response)> {
        self.shared
            .entries
            .read()
            .await
            .values()
            .map(|entry| (entry.request.clone(), entry.response.clone()))
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.shared.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.shared.entries.read().await.is_empty()
    }

    /// Cuts the store off from its file. Waits for a write in progress, so
    /// once this returns nothing will recreate the file.
    pub(crate) async fn detach(&self) {
        let _guard = self.shared.write_lock.lock().await;
        self.shared.detached.store(true, Ordering::SeqCst);
    }

    /// Blocks every write to this store until the guard drops.
    #[cfg(test)]
    pub(crate) async fn hold_writes(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.shared.write_lock.lock().await
    }

    /// Writes the store file, if this store is persistent.
    pub(crate) async fn persist(&self) -> Result<(), CacheError> {
        let _guard = self.shared.write_lock.lock().await;
        self.write_file().await
    }

    /// Snapshots the entries into the store file. Callers hold `write_lock`.
    async fn write_file(&self) -> Result<(), CacheError> {
        let Some(file) = &self.shared.file else {
            return Ok(());
        };
        if self.shared.detached.load(Ordering::SeqCst) {
            return Ok(());
        }

        let snapshot = StoredStore {
            name: self.shared.name.clone(),
            entries: self
                .shared
                .entries
                .read()
                .await
                .values()
                .map(|entry| StoredEntry::new(&entry.request, &entry.response))
                .collect(),
        };
        let contents = serde_json::to_vec(&snapshot)?;

        let tmp = file.with_extension("json.tmp");
        tokio::fs::write(&tmp, contents)
            .await
            .map_err(|source| CacheError::io(&tmp, source))?;
        tokio::fs::rename(&tmp, file)
            .await
            .map_err(|source| CacheError::io(file, source))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{Method, StatusCode};

    fn get(url: &str) -> Request {
        Request::get(url).unwrap()
    }

    #[tokio::test]
    async fn put_then_match() {
        let cache = Cache::new("shell", None);
        let req = get("http://localhost/manifest.json");
        cache
            .put(&req, &Response::new(StatusCode::OK).body("{}"))
            .await
            .unwrap();

        let hit = cache.match_request(&req).await.unwrap();
        assert_eq!(hit.body_bytes().as_ref(), b"{}");
        assert!(cache.match_request(&get("http://localhost/other")).await.is_none());
    }

    #[tokio::test]
    async fn last_write_wins() {
        let cache = Cache::new("shell", None);
        let req = get("http://localhost/a");
        cache.put(&req, &Response::new(StatusCode::OK).body("1")).await.unwrap();
        cache.put(&req, &Response::new(StatusCode::OK).body("2")).await.unwrap();
        assert_eq!(cache.len().await, 1);
        let hit = cache.match_request(&req).await.unwrap();
        assert_eq!(hit.body_bytes().as_ref(), b"2");
    }

    #[tokio::test]
    async fn non_get_is_rejected() {
        let cache = Cache::new("data", None);
        let req = Request::with_method(Method::Post, "https://api.example.com/v1/stories").unwrap();
        let err = cache.put(&req, &Response::default()).await.unwrap_err();
        assert!(matches!(err, CacheError::MethodNotCacheable(m) if m == "POST"));
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn delete_and_keys() {
        let cache = Cache::new("data", None);
        let a = get("https://api.example.com/a");
        let b = get("https://api.example.com/b");
        cache.put(&a, &Response::default()).await.unwrap();
        cache.put(&b, &Response::default()).await.unwrap();

        assert!(cache.delete(&a).await.unwrap());
        assert!(!cache.delete(&a).await.unwrap());

        let keys: Vec<String> = cache.keys().await.iter().map(|r| r.url().to_string()).collect();
        assert_eq!(keys, vec!["https://api.example.com/b"]);
    }

    #[tokio::test]
    async fn put_all_rejects_the_batch_on_one_bad_method() {
        let cache = Cache::new("shell", None);
        let pairs = vec![
            (get("http://localhost/a"), Response::default()),
            (Request::with_method(Method::Put, "http://localhost/b").unwrap(), Response::default()),
        ];
        assert!(cache.put_all(&pairs).await.is_err());
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn failed_write_restores_previous_entries() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("caches");
        let storage = crate::cache::CacheStorage::persistent(&root).await.unwrap();
        let cache = storage.open("shell").await.unwrap();
        let kept = get("http://localhost/kept");
        cache.put(&kept, &Response::new(StatusCode::OK).body("old")).await.unwrap();

        std::fs::remove_dir_all(&root).unwrap();
        let pairs = vec![
            (kept.clone(), Response::new(StatusCode::OK).body("new")),
            (get("http://localhost/fresh"), Response::default()),
        ];
        let err = cache.put_all(&pairs).await.unwrap_err();
        assert!(matches!(err, CacheError::Io { .. }));
        assert_eq!(cache.len().await, 1);
        let hit = cache.match_request(&kept).await.unwrap();
        assert_eq!(hit.body_bytes().as_ref(), b"old");

        assert!(cache.put(&get("http://localhost/other"), &Response::default()).await.is_err());
        assert_eq!(cache.len().await, 1);
        assert!(cache.delete(&kept).await.is_err());
        assert!(cache.match_request(&kept).await.is_some());
    }

    #[tokio::test]
    async fn query_string_is_part_of_identity() {
        let cache = Cache::new("data", None);
        cache
            .put(&get("https://api.example.com/v1/stories?page=1"), &Response::default())
            .await
            .unwrap();
        assert!(cache
            .match_request(&get("https://api.example.com/v1/stories?page=2"))
            .await
            .is_none());
    }
}
