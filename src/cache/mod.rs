//! Cache store registry: named, versioned request/response stores.
//!
//! [`CacheStorage`] is the registry (the worker's `caches` global): it opens,
//! lists and deletes stores by name. [`Cache`] is a handle to one store.
//!
//! Storage comes in two flavours:
//!
//! - [`CacheStorage::in_memory`]: entries live for the life of the process.
//! - [`CacheStorage::persistent`]: every store is mirrored to
//!   `<dir>/<name>.json` and reloaded on startup, so stores survive restarts
//!   until explicitly deleted.
//!
//! All operations are async and may run concurrently. Each store serialises
//! its own writes; there is no cross-store locking.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::http::{Request, Response};

mod store;
mod stored;

pub use store::Cache;
pub use stored::StoredResponse;

use stored::StoredStore;

/// Errors produced by the cache layer.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("invalid store name {0:?}: only ASCII letters, digits, '.', '_' and '-' are allowed")]
    InvalidName(String),

    #[error("{0} requests cannot be cached")]
    MethodNotCacheable(String),

    #[error("cache I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize cache store: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("corrupt cache entry: {reason}")]
    Corrupt { reason: String },
}

impl CacheError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

#[derive(Debug)]
struct Registry {
    stores: RwLock<BTreeMap<String, Cache>>,
    dir: Option<PathBuf>,
}

/// The registry of named cache stores.
///
/// Cheap to clone; clones share the same stores.
///
/// # Examples
///
/// ```
/// use offcache::cache::CacheStorage;
/// use offcache::http::{Request, Response, StatusCode};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let caches = CacheStorage::in_memory();
/// let shell = caches.open("app-shell-v1").await?;
/// let again = caches.open("app-shell-v1").await?;
///
/// let request = Request::get("http://localhost/manifest.json")?;
/// shell.put(&request, &Response::new(StatusCode::OK).body("{}")).await?;
/// assert!(again.match_request(&request).await.is_some());
/// assert_eq!(caches.keys().await, vec!["app-shell-v1".to_owned()]);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct CacheStorage {
    registry: Arc<Registry>,
}

impl CacheStorage {
    /// Creates an empty, process-local registry.
    pub fn in_memory() -> Self {
        Self {
            registry: Arc::new(Registry {
                stores: RwLock::new(BTreeMap::new()),
                dir: None,
            }),
        }
    }

    /// Opens a registry backed by `dir`, loading every store file found there.
    ///
    /// Unreadable store files are skipped with a warning rather than failing
    /// the whole registry.
    pub async fn persistent(dir: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|source| CacheError::io(&dir, source))?;

        let mut stores = BTreeMap::new();
        let mut listing = tokio::fs::read_dir(&dir)
            .await
            .map_err(|source| CacheError::io(&dir, source))?;
        while let Some(dirent) = listing
            .next_entry()
            .await
            .map_err(|source| CacheError::io(&dir, source))?
        {
            let path = dirent.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match load_store(&path).await {
                Ok(stored) if valid_name(&stored.name) => {
                    let name = stored.name.clone();
                    stores.insert(name, Cache::from_stored(stored, path));
                }
                Ok(stored) => {
                    warn!(path = %path.display(), name = %stored.name, "ignoring store file with invalid name");
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "ignoring unreadable store file");
                }
            }
        }

        info!(dir = %dir.display(), stores = stores.len(), "cache storage loaded");
        Ok(Self {
            registry: Arc::new(Registry {
                stores: RwLock::new(stores),
                dir: Some(dir),
            }),
        })
    }

    /// Opens the store called `name`, creating it if absent.
    ///
    /// Idempotent: every call with the same name returns a handle to the same
    /// underlying store.
    pub async fn open(&self, name: &str) -> Result<Cache, CacheError> {
        if !valid_name(name) {
            return Err(CacheError::InvalidName(name.to_owned()));
        }

        if let Some(cache) = self.registry.stores.read().await.get(name) {
            return Ok(cache.clone());
        }

        let (cache, created) = {
            let mut stores = self.registry.stores.write().await;
            match stores.get(name) {
                Some(cache) => (cache.clone(), false),
                None => {
                    let file = self.registry.dir.as_ref().map(|d| store_file(d, name));
                    let cache = Cache::new(name, file);
                    stores.insert(name.to_owned(), cache.clone());
                    (cache, true)
                }
            }
        };

        if created {
            debug!(store = %name, "cache store created");
            cache.persist().await?;
        }
        Ok(cache)
    }

    /// Returns `true` if a store called `name` exists.
    pub async fn has(&self, name: &str) -> bool {
        self.registry.stores.read().await.contains_key(name)
    }

    /// Deletes the store called `name` and its backing file. Returns `true` if it existed.
    pub async fn delete(&self, name: &str) -> Result<bool, CacheError> {
        let Some(cache) = self.registry.stores.write().await.remove(name) else {
            return Ok(false);
        };
        cache.detach().await;

        if let Some(dir) = &self.registry.dir {
            let file = store_file(dir, name);
            match tokio::fs::remove_file(&file).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(source) => return Err(CacheError::io(&file, source)),
            }
        }

        debug!(store = %name, "cache store deleted");
        Ok(true)
    }

    /// Lists every store name, sorted.
    pub async fn keys(&self) -> Vec<String> {
        self.registry.stores.read().await.keys().cloned().collect()
    }

    /// Looks `request` up in every store, in name order, returning the first hit.
    pub async fn match_request(&self, request: &Request) -> Option<Response> {
        let stores: Vec<Cache> = self.registry.stores.read().await.values().cloned().collect();
        for cache in stores {
            if let Some(response) = cache.match_request(request).await {
                return Some(response);
            }
        }
        None
    }
}

pub(crate) fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
        && name != "."
        && name != ".."
}

fn store_file(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}.json"))
}

async fn load_store(path: &Path) -> Result<StoredStore, CacheError> {
    let contents = tokio::fs::read(path)
        .await
        .map_err(|source| CacheError::io(path, source))?;
    Ok(serde_json::from_slice(&contents)?)
}
