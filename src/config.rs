//! Worker configuration.
//!
//! Everything the worker would otherwise keep as module-level constants (store
//! names, the install manifest, origins) lives in one immutable
//! [`WorkerConfig`], shared by the lifecycle controller and the strategy
//! engine through an `Arc`.
//!
//! A config can be built in code or loaded from JSON; every field has a
//! default, so a file only needs the keys it overrides. Durations are
//! expressed in milliseconds.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Deserializer};
use thiserror::Error;
use url::Url;

/// Errors produced while loading or validating a [`WorkerConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid {field} origin {value:?}: {source}")]
    InvalidOrigin {
        field: &'static str,
        value: String,
        #[source]
        source: url::ParseError,
    },

    #[error("{field} must be an absolute path, got {value:?}")]
    InvalidPath { field: &'static str, value: String },

    #[error("store_prefix and epoch give an invalid store name {0:?}")]
    InvalidStoreName(String),
}

/// Whether the worker caches at all.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerMode {
    /// Full offline behaviour.
    #[default]
    Production,
    /// Pass-through worker: no precache, no purge, no caching.
    Development,
}

/// Immutable worker configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Origin the application shell is served from.
    pub app_origin: String,
    /// Requests to this origin are classified as API data.
    pub api_origin: String,
    /// Default notification title.
    pub app_name: String,
    /// Path of the page a notification click focuses or opens.
    pub app_root: String,
    /// Prefix of every store name.
    pub store_prefix: String,
    /// Version epoch embedded in store names.
    pub epoch: String,
    /// Paths precached into the shell store at install.
    pub shell_manifest: Vec<String>,
    /// Path served when a navigation cannot reach the network.
    pub offline_fallback: String,
    /// Maximum age of an API entry.
    #[serde(rename = "data_max_age_ms", deserialize_with = "millis")]
    pub data_max_age: Duration,
    /// Optional cap on the number of API entries kept.
    pub max_data_entries: Option<usize>,
    /// Optional bound on how long an API request waits for the network.
    #[serde(rename = "network_timeout_ms", deserialize_with = "opt_millis")]
    pub network_timeout: Option<Duration>,
    /// Static asset extensions served stale-while-revalidate instead of cache-first.
    pub revalidate_extensions: Vec<String>,
    pub mode: WorkerMode,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            app_origin: "http://localhost:9000".to_owned(),
            api_origin: "https://story-api.dicoding.dev".to_owned(),
            app_name: "Dicoding Story".to_owned(),
            app_root: "/".to_owned(),
            store_prefix: "dicoding-story".to_owned(),
            epoch: "v1".to_owned(),
            shell_manifest: vec![
                "/".to_owned(),
                "/index.html".to_owned(),
                "/manifest.json".to_owned(),
                "/styles/main.css".to_owned(),
                "/images/icons/icon-192x192.png".to_owned(),
            ],
            offline_fallback: "/index.html".to_owned(),
            data_max_age: Duration::from_secs(5 * 60),
            max_data_entries: None,
            network_timeout: None,
            revalidate_extensions: Vec::new(),
            mode: WorkerMode::Production,
        }
    }
}

impl WorkerConfig {
    /// Loads a config from a JSON file and validates it.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&contents)
    }

    /// Parses a config from a JSON string and validates it.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks that origins parse, paths are absolute and the derived store
    /// names are usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.app_url()?;
        self.api_url()?;
        for name in self.known_stores() {
            if !crate::cache::valid_name(&name) {
                return Err(ConfigError::InvalidStoreName(name));
            }
        }
        let paths = std::iter::once(("offline_fallback", &self.offline_fallback))
            .chain(std::iter::once(("app_root", &self.app_root)))
            .chain(self.shell_manifest.iter().map(|p| ("shell_manifest", p)));
        for (field, value) in paths {
            if !value.starts_with('/') {
                return Err(ConfigError::InvalidPath {
                    field,
                    value: value.clone(),
                });
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn with_app_origin(mut self, origin: impl Into<String>) -> Self {
        self.app_origin = origin.into();
        self
    }

    #[must_use]
    pub fn with_api_origin(mut self, origin: impl Into<String>) -> Self {
        self.api_origin = origin.into();
        self
    }

    #[must_use]
    pub fn with_epoch(mut self, epoch: impl Into<String>) -> Self {
        self.epoch = epoch.into();
        self
    }

    #[must_use]
    pub fn with_store_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.store_prefix = prefix.into();
        self
    }

    #[must_use]
    pub fn with_shell_manifest<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.shell_manifest = paths.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_data_max_age(mut self, max_age: Duration) -> Self {
        self.data_max_age = max_age;
        self
    }

    #[must_use]
    pub fn with_max_data_entries(mut self, max: usize) -> Self {
        self.max_data_entries = Some(max);
        self
    }

    #[must_use]
    pub fn with_network_timeout(mut self, timeout: Duration) -> Self {
        self.network_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_revalidate_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.revalidate_extensions = extensions.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_mode(mut self, mode: WorkerMode) -> Self {
        self.mode = mode;
        self
    }

    /// Name of the shell store for the current epoch.
    pub fn shell_store(&self) -> String {
        format!("{}-shell-{}", self.store_prefix, self.epoch)
    }

    /// Name of the API data store for the current epoch.
    pub fn data_store(&self) -> String {
        format!("{}-data-{}", self.store_prefix, self.epoch)
    }

    /// Store names that survive activation.
    pub fn known_stores(&self) -> [String; 2] {
        [self.shell_store(), self.data_store()]
    }

    /// The API origin, parsed.
    pub fn api_url(&self) -> Result<Url, ConfigError> {
        parse_origin("api_origin", &self.api_origin)
    }

    /// The application origin, parsed.
    pub fn app_url(&self) -> Result<Url, ConfigError> {
        parse_origin("app_origin", &self.app_origin)
    }

    /// The serialized API origin used for request classification.
    pub fn api_origin_serialized(&self) -> Result<String, ConfigError> {
        Ok(self.api_url()?.origin().ascii_serialization())
    }

    /// Resolves an app-relative path (e.g. a manifest entry) against the app origin.
    pub fn app_resource(&self, path: &str) -> Result<Url, ConfigError> {
        self.app_url()?
            .join(path)
            .map_err(|source| ConfigError::InvalidOrigin {
                field: "app_origin",
                value: format!("{}{}", self.app_origin, path),
                source,
            })
    }
}

fn parse_origin(field: &'static str, value: &str) -> Result<Url, ConfigError> {
    Url::parse(value).map_err(|source| ConfigError::InvalidOrigin {
        field,
        value: value.to_owned(),
        source,
    })
}

fn millis<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    u64::deserialize(deserializer).map(Duration::from_millis)
}

fn opt_millis<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
    Option::<u64>::deserialize(deserializer).map(|ms| ms.map(Duration::from_millis))
}
