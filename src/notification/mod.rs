//! Notification bridge: push messages in, notifications out, clicks back to a window.
//!
//! Showing a notification is the host's job; the worker hands finished
//! [`Notification`]s to a [`Notifier`]. Two are provided: [`TracingNotifier`]
//! only logs, [`ChannelNotifier`] forwards to any number of subscribers.

use std::fmt;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::clients::{Client, ClientError, ClientQuery, Clients};
use crate::config::{ConfigError, WorkerConfig, WorkerMode};
use crate::expiry::Clock;

pub const DEFAULT_ICON: &str = "/images/icons/icon-192x192.png";
pub const DEFAULT_TAG: &str = "story-notification";
pub const DEFAULT_BODY: &str = "New notification";

#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("notifier rejected notification: {0}")]
    Rejected(String),

    #[error("client error: {0}")]
    Client(#[from] ClientError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}

/// Display options. Any field left out of a JSON document takes its default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NotificationOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    pub icon: String,
    pub badge: String,
    pub vibrate: Vec<u32>,
    pub tag: String,
    pub require_interaction: bool,
    pub data: serde_json::Value,
}

impl Default for NotificationOptions {
    fn default() -> Self {
        Self {
            body: None,
            icon: DEFAULT_ICON.to_owned(),
            badge: DEFAULT_ICON.to_owned(),
            vibrate: vec![100, 50, 100],
            tag: DEFAULT_TAG.to_owned(),
            require_interaction: false,
            data: serde_json::Value::Null,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub title: String,
    pub options: NotificationOptions,
}

impl Notification {
    pub fn new(title: impl Into<String>, options: NotificationOptions) -> Self {
        Self {
            title: title.into(),
            options,
        }
    }
}

/// The recognized part of a push message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PushPayload {
    pub title: Option<String>,
    pub options: PushOptions,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PushOptions {
    pub body: Option<String>,
}

impl PushPayload {
    /// Parses a push message body. Never fails: a missing or malformed body
    /// yields the default payload.
    pub fn parse(data: Option<&[u8]>) -> Self {
        let Some(data) = data.filter(|d| !d.is_empty()) else {
            return Self::default();
        };
        match serde_json::from_slice(data) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, bytes = data.len(), "malformed push payload, using defaults");
                Self::default()
            }
        }
    }

    /// Builds the notification to show, filling gaps from `app_name` and the defaults.
    pub fn into_notification(self, app_name: &str, now_millis: i64) -> Notification {
        let title = non_empty(self.title).unwrap_or_else(|| app_name.to_owned());
        let body = non_empty(self.options.body).unwrap_or_else(|| DEFAULT_BODY.to_owned());
        let options = NotificationOptions {
            body: Some(body),
            data: json!({ "dateOfArrival": now_millis, "primaryKey": 1 }),
            ..NotificationOptions::default()
        };
        Notification::new(title, options)
    }
}

fn non_empty(s: Option<String>) -> Option<String> {
    s.filter(|s| !s.is_empty())
}

/// Shows and closes notifications on behalf of the worker.
pub trait Notifier: Send + Sync {
    fn show<'a>(&'a self, notification: &'a Notification) -> BoxFuture<'a, Result<(), NotificationError>>;

    /// Closes every shown notification carrying `tag`.
    fn close(&self, tag: &str);
}

/// Logs notifications instead of displaying them.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn show<'a>(&'a self, notification: &'a Notification) -> BoxFuture<'a, Result<(), NotificationError>> {
        Box::pin(async move {
            info!(
                title = %notification.title,
                body = notification.options.body.as_deref().unwrap_or_default(),
                tag = %notification.options.tag,
                "show notification"
            );
            Ok(())
        })
    }

    fn close(&self, tag: &str) {
        info!(tag, "close notification");
    }
}

/// What a [`ChannelNotifier`] publishes.
#[derive(Debug, Clone, PartialEq)]
pub enum NotifierEvent {
    Shown(Notification),
    Closed(String),
}

/// Publishes notifications to broadcast subscribers, e.g. a UI shell.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: broadcast::Sender<NotifierEvent>,
}

impl ChannelNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NotifierEvent> {
        self.tx.subscribe()
    }
}

impl Notifier for ChannelNotifier {
    fn show<'a>(&'a self, notification: &'a Notification) -> BoxFuture<'a, Result<(), NotificationError>> {
        Box::pin(async move {
            self.tx
                .send(NotifierEvent::Shown(notification.clone()))
                .map(|_| ())
                .map_err(|_| NotificationError::Rejected("no subscribers".to_owned()))
        })
    }

    fn close(&self, tag: &str) {
        // Nobody listening means nothing is on screen to close.
        let _ = self.tx.send(NotifierEvent::Closed(tag.to_owned()));
    }
}

/// Where a notification click led.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClickOutcome {
    Focused(Client),
    Opened(Client),
}

impl fmt::Display for ClickOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Focused(c) => write!(f, "focused {}", c.id),
            Self::Opened(c) => write!(f, "opened {}", c.id),
        }
    }
}

/// Handles a push message: parse defensively, then show.
pub async fn on_push(
    data: Option<&[u8]>,
    config: &WorkerConfig,
    notifier: &dyn Notifier,
    clock: &dyn Clock,
) -> Result<Notification, NotificationError> {
    let notification = PushPayload::parse(data).into_notification(&config.app_name, clock.now_millis());
    notifier.show(&notification).await?;
    debug!(title = %notification.title, "push notification shown");
    Ok(notification)
}

/// Handles a notification click: close it, then focus the app window or open one.
pub async fn on_notification_click(
    notification: &Notification,
    config: &WorkerConfig,
    notifier: &dyn Notifier,
    clients: &Clients,
) -> Result<ClickOutcome, NotificationError> {
    notifier.close(&notification.options.tag);

    let root = config.app_resource(&config.app_root)?;
    // A development worker never claims, so its windows stay uncontrolled.
    let query = ClientQuery {
        include_uncontrolled: config.mode == WorkerMode::Development,
        ..ClientQuery::windows()
    };
    let existing = clients
        .match_all(query)
        .await
        .into_iter()
        .find(|c| c.url.origin() == root.origin() && c.url.path() == root.path());

    let outcome = match existing {
        Some(client) => ClickOutcome::Focused(clients.focus(client.id).await?),
        None => ClickOutcome::Opened(clients.open_window(root).await),
    };
    info!(outcome = %outcome, "notification click handled");
    Ok(outcome)
}
