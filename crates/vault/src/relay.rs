//! Change notifications between vault instances
//!
//! Synchronization works without any relay: instances poll the store. A
//! relay only shortens the delay. Whenever an instance writes a ledger block
//! or a file header it publishes the object path; other instances of the
//! same vault react by syncing the ledger or importing that one header.
//!
//! The wire format is line oriented text:
//!
//! - `+<realm>` subscribes to a realm
//! - `-<realm>` unsubscribes
//! - `<vault id>:<instance id>:<path>` announces a new object
//!
//! [`WebSocketRelay`] speaks it to a remote relay server. [`LocalRelay`]
//! connects instances living in the same process.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use crate::error::{Result, VaultError};

/// A new object written by an instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub vault_id: String,
    pub instance_id: String,
    pub path: String,
}

impl Notification {
    /// Realm part of the vault id.
    pub fn realm(&self) -> &str {
        self.vault_id
            .split_once('@')
            .map_or(self.vault_id.as_str(), |(realm, _)| realm)
    }

    /// Parse `<vault id>:<instance id>:<path>`. Vault ids may hold colons,
    /// instance ids and paths never do.
    pub fn parse(text: &str) -> Option<Self> {
        let mut parts = text.rsplitn(3, ':');
        let path = parts.next()?;
        let instance_id = parts.next()?;
        let vault_id = parts.next()?;
        if vault_id.is_empty() || instance_id.is_empty() || path.is_empty() {
            return None;
        }
        Some(Notification {
            vault_id: vault_id.to_string(),
            instance_id: instance_id.to_string(),
            path: path.to_string(),
        })
    }
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.vault_id, self.instance_id, self.path)
    }
}

/// Carries notifications between instances of a vault.
#[async_trait]
pub trait ChangeNotifier: fmt::Debug + Send + Sync {
    /// Receive every notification for `realm`, own ones included.
    async fn subscribe(&self, realm: &str) -> Result<flume::Receiver<Notification>>;

    /// Drop every subscription to `realm`.
    async fn unsubscribe(&self, realm: &str) -> Result<()>;

    async fn publish(&self, notification: &Notification) -> Result<()>;
}

/// Local receivers, by realm
#[derive(Debug, Default)]
struct Subscribers(Mutex<HashMap<String, Vec<flume::Sender<Notification>>>>);

impl Subscribers {
    fn add(&self, realm: &str) -> flume::Receiver<Notification> {
        let (tx, rx) = flume::unbounded();
        self.0.lock().entry(realm.to_string()).or_default().push(tx);
        rx
    }

    /// Returns whether the realm had subscribers.
    fn remove(&self, realm: &str) -> bool {
        self.0.lock().remove(realm).is_some()
    }

    fn dispatch(&self, notification: &Notification) {
        let mut subscribers = self.0.lock();
        let realm = notification.realm();
        if let Some(senders) = subscribers.get_mut(realm) {
            senders.retain(|tx| tx.send(notification.clone()).is_ok());
            if senders.is_empty() {
                subscribers.remove(realm);
            }
        }
    }
}

/// Client of a WebSocket relay server
#[derive(Debug)]
pub struct WebSocketRelay {
    url: Url,
    outgoing: flume::Sender<String>,
    subscribers: Arc<Subscribers>,
    tasks: Vec<JoinHandle<()>>,
}

impl WebSocketRelay {
    /// Connect to a `ws://` or `wss://` relay.
    pub async fn connect(url: &str) -> Result<Self> {
        let url = Url::parse(url)
            .map_err(|e| VaultError::Config(format!("invalid sync relay {}: {}", url, e)))?;
        if url.scheme() != "ws" && url.scheme() != "wss" {
            return Err(VaultError::Config(format!(
                "sync relay must be ws:// or wss://, got {}",
                url
            )));
        }

        let (stream, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| VaultError::Relay(format!("connect to {} failed: {}", url, e)))?;
        let (mut sink, mut source) = stream.split();
        let (outgoing, queue) = flume::unbounded::<String>();
        let subscribers = Arc::new(Subscribers::default());

        let writer_url = url.clone();
        let writer = tokio::spawn(async move {
            while let Ok(text) = queue.recv_async().await {
                if let Err(e) = sink.send(Message::Text(text)).await {
                    tracing::warn!(relay = %writer_url, error = %e, "relay send failed");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let reader_url = url.clone();
        let inbox = subscribers.clone();
        let reader = tokio::spawn(async move {
            while let Some(message) = source.next().await {
                match message {
                    Ok(Message::Text(text)) => match Notification::parse(text.trim()) {
                        Some(notification) => inbox.dispatch(&notification),
                        None => tracing::debug!(relay = %reader_url, text = %text, "ignoring relay message"),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(relay = %reader_url, error = %e, "relay receive failed");
                        break;
                    }
                }
            }
            tracing::info!(relay = %reader_url, "relay connection closed");
        });

        tracing::info!(relay = %url, "connected to relay");
        Ok(WebSocketRelay {
            url,
            outgoing,
            subscribers,
            tasks: vec![writer, reader],
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    fn send(&self, text: String) -> Result<()> {
        self.outgoing
            .send(text)
            .map_err(|_| VaultError::Relay(format!("connection to {} is closed", self.url)))
    }
}

impl Drop for WebSocketRelay {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[async_trait]
impl ChangeNotifier for WebSocketRelay {
    async fn subscribe(&self, realm: &str) -> Result<flume::Receiver<Notification>> {
        let rx = self.subscribers.add(realm);
        self.send(format!("+{}", realm))?;
        Ok(rx)
    }

    async fn unsubscribe(&self, realm: &str) -> Result<()> {
        if self.subscribers.remove(realm) {
            self.send(format!("-{}", realm))?;
        }
        Ok(())
    }

    async fn publish(&self, notification: &Notification) -> Result<()> {
        self.send(notification.to_string())
    }
}

/// In-process relay for instances sharing a runtime
#[derive(Debug, Clone, Default)]
pub struct LocalRelay {
    subscribers: Arc<Subscribers>,
}

impl LocalRelay {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChangeNotifier for LocalRelay {
    async fn subscribe(&self, realm: &str) -> Result<flume::Receiver<Notification>> {
        Ok(self.subscribers.add(realm))
    }

    async fn unsubscribe(&self, realm: &str) -> Result<()> {
        self.subscribers.remove(realm);
        Ok(())
    }

    async fn publish(&self, notification: &Notification) -> Result<()> {
        self.subscribers.dispatch(notification);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notification(path: &str) -> Notification {
        Notification {
            vault_id: "users@s3://bucket/prefix".to_string(),
            instance_id: "6f1c".to_string(),
            path: path.to_string(),
        }
    }

    #[test]
    fn test_parse_with_colons_in_vault_id() {
        let n = notification("users/data/20250101000000/h/abc");
        let parsed = Notification::parse(&n.to_string()).unwrap();
        assert_eq!(parsed, n);
        assert_eq!(parsed.realm(), "users");
    }

    #[test]
    fn test_parse_rejects_partial_messages() {
        assert_eq!(Notification::parse("+users"), None);
        assert_eq!(Notification::parse("a::b"), None);
        assert_eq!(Notification::parse(":i:p"), None);
    }

    #[tokio::test]
    async fn test_local_relay_routes_by_realm() {
        let relay = LocalRelay::new();
        let users = relay.subscribe("users").await.unwrap();
        let home = relay.subscribe("home").await.unwrap();

        relay.publish(&notification("users/blockchain/x")).await.unwrap();
        assert_eq!(users.try_recv().unwrap().path, "users/blockchain/x");
        assert!(home.try_recv().is_err());

        relay.unsubscribe("users").await.unwrap();
        relay.publish(&notification("users/blockchain/y")).await.unwrap();
        assert!(users.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dropped_receivers_are_pruned() {
        let relay = LocalRelay::new();
        drop(relay.subscribe("users").await.unwrap());
        relay.publish(&notification("users/blockchain/x")).await.unwrap();
        assert!(relay.subscribers.0.lock().is_empty());
    }

    #[tokio::test]
    async fn test_websocket_relay_rejects_http() {
        let err = WebSocketRelay::connect("http://localhost:1").await.unwrap_err();
        assert!(matches!(err, VaultError::Config(_)));
    }
}
