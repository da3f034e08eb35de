//! Clients: the pages and workers a worker can see.
//!
//! The host registers a client when a page opens and removes it when the page
//! goes away. A client only counts as *controlled* once the active worker has
//! claimed it; until then [`Clients::match_all`] hides it unless the query
//! asks for uncontrolled clients too.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};
use url::Url;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("no client with id {0}")]
    NotFound(ClientId),

    #[error("client {0} is not a window")]
    NotWindow(ClientId),
}

/// Opaque client identifier, unique within one [`Clients`] registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClientId(u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ClientType {
    #[default]
    Window,
    Worker,
    /// Query-only: matches every type.
    All,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Client {
    pub id: ClientId,
    pub url: Url,
    pub client_type: ClientType,
    pub focused: bool,
    pub controlled: bool,
}

/// Filter for [`Clients::match_all`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ClientQuery {
    pub include_uncontrolled: bool,
    pub client_type: ClientType,
}

impl ClientQuery {
    pub fn windows() -> Self {
        Self::default()
    }

    fn matches(&self, client: &Client) -> bool {
        (self.include_uncontrolled || client.controlled)
            && match self.client_type {
                ClientType::All => true,
                t => client.client_type == t,
            }
    }
}

/// Shared registry of clients. Cloning yields another handle to the same set.
#[derive(Debug, Clone, Default)]
pub struct Clients {
    clients: Arc<RwLock<BTreeMap<ClientId, Client>>>,
    next_id: Arc<AtomicU64>,
}

impl Clients {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an uncontrolled, unfocused client.
    pub async fn add(&self, url: Url, client_type: ClientType) -> Client {
        let client = Client {
            id: self.allocate_id(),
            url,
            client_type,
            focused: false,
            controlled: false,
        };
        debug!(client = %client.id, url = %client.url, "client registered");
        self.clients.write().await.insert(client.id, client.clone());
        client
    }

    pub async fn remove(&self, id: ClientId) -> Option<Client> {
        self.clients.write().await.remove(&id)
    }

    pub async fn get(&self, id: ClientId) -> Option<Client> {
        self.clients.read().await.get(&id).cloned()
    }

    /// Clients matching `query`, in registration order.
    pub async fn match_all(&self, query: ClientQuery) -> Vec<Client> {
        self.clients
            .read()
            .await
            .values()
            .filter(|c| query.matches(c))
            .cloned()
            .collect()
    }

    /// Focuses a window client, unfocusing every other client.
    pub async fn focus(&self, id: ClientId) -> Result<Client, ClientError> {
        let mut clients = self.clients.write().await;
        match clients.get(&id) {
            None => return Err(ClientError::NotFound(id)),
            Some(c) if c.client_type != ClientType::Window => return Err(ClientError::NotWindow(id)),
            Some(_) => {}
        }
        let mut focused = None;
        for client in clients.values_mut() {
            client.focused = client.id == id;
            if client.focused {
                focused = Some(client.clone());
            }
        }
        focused.ok_or(ClientError::NotFound(id))
    }

    /// Opens a new focused window at `url`. The window is controlled by the
    /// active worker from the start.
    pub async fn open_window(&self, url: Url) -> Client {
        let mut clients = self.clients.write().await;
        for client in clients.values_mut() {
            client.focused = false;
        }
        let client = Client {
            id: self.allocate_id(),
            url,
            client_type: ClientType::Window,
            focused: true,
            controlled: true,
        };
        info!(client = %client.id, url = %client.url, "opened window");
        clients.insert(client.id, client.clone());
        client
    }

    /// Takes control of every registered client. Returns how many changed.
    pub async fn claim(&self) -> usize {
        let mut claimed = 0;
        for client in self.clients.write().await.values_mut() {
            if !client.controlled {
                client.controlled = true;
                claimed += 1;
            }
        }
        debug!(claimed, "claimed clients");
        claimed
    }

    fn allocate_id(&self) -> ClientId {
        ClientId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[tokio::test]
    async fn uncontrolled_clients_are_hidden_until_claimed() {
        let clients = Clients::new();
        clients.add(url("http://localhost:9000/"), ClientType::Window).await;
        clients.add(url("http://localhost:9000/sw.js"), ClientType::Worker).await;

        assert!(clients.match_all(ClientQuery::windows()).await.is_empty());
        let all = ClientQuery {
            include_uncontrolled: true,
            client_type: ClientType::All,
        };
        assert_eq!(clients.match_all(all).await.len(), 2);

        assert_eq!(clients.claim().await, 2);
        assert_eq!(clients.claim().await, 0);
        let windows = clients.match_all(ClientQuery::windows()).await;
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].url.path(), "/");
    }

    #[tokio::test]
    async fn focus_moves_between_windows() {
        let clients = Clients::new();
        let a = clients.add(url("http://localhost:9000/"), ClientType::Window).await;
        let b = clients.add(url("http://localhost:9000/#/add"), ClientType::Window).await;

        assert!(clients.focus(a.id).await.unwrap().focused);
        clients.focus(b.id).await.unwrap();
        assert!(!clients.get(a.id).await.unwrap().focused);
        assert!(clients.get(b.id).await.unwrap().focused);
    }

    #[tokio::test]
    async fn focus_rejects_workers_and_unknown_ids() {
        let clients = Clients::new();
        let worker = clients.add(url("http://localhost:9000/w.js"), ClientType::Worker).await;
        assert!(matches!(clients.focus(worker.id).await, Err(ClientError::NotWindow(_))));

        clients.remove(worker.id).await;
        assert!(matches!(clients.focus(worker.id).await, Err(ClientError::NotFound(_))));
    }

    #[tokio::test]
    async fn opened_window_is_focused_and_controlled() {
        let clients = Clients::new();
        let existing = clients.add(url("http://localhost:9000/a"), ClientType::Window).await;
        clients.focus(existing.id).await.unwrap();

        let opened = clients.open_window(url("http://localhost:9000/")).await;
        assert!(opened.focused && opened.controlled);
        assert!(!clients.get(existing.id).await.unwrap().focused);
        assert_ne!(opened.id, existing.id);
    }
}
