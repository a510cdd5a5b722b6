//! Authenticated client connections and the primary-client slot.
//!
//! Server-initiated messages (injected notices, re-verification prompts) go
//! to a single primary client. The most recently authenticated connection
//! becomes primary; when it closes the slot is cleared rather than handed to
//! an older connection.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, oneshot};
use tracing::{debug, info, warn};

use crate::gateway::sink::ClientSink;
use crate::protocol::ServerMessage;

#[derive(Clone, Default)]
pub struct ClientRegistry {
    clients: Arc<RwLock<HashMap<String, ClientSink>>>,
    primary: Arc<RwLock<Option<String>>>,
    reverify: Arc<RwLock<HashMap<String, oneshot::Sender<bool>>>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an authenticated client and make it primary.
    pub async fn register(&self, visitor_id: &str, sink: ClientSink) {
        self.clients
            .write()
            .await
            .insert(visitor_id.to_string(), sink);
        let previous = self.primary.write().await.replace(visitor_id.to_string());
        info!(
            visitor_id,
            previous = previous.as_deref().unwrap_or("none"),
            "Client registered as primary"
        );
    }

    pub async fn unregister(&self, visitor_id: &str) {
        if self.clients.write().await.remove(visitor_id).is_none() {
            return;
        }
        let mut primary = self.primary.write().await;
        if primary.as_deref() == Some(visitor_id) {
            *primary = None;
            info!(visitor_id, "Primary client unregistered");
        } else {
            debug!(visitor_id, "Client unregistered");
        }
    }

    pub async fn primary(&self) -> Option<String> {
        self.primary.read().await.clone()
    }

    pub async fn get(&self, visitor_id: &str) -> Option<ClientSink> {
        self.clients.read().await.get(visitor_id).cloned()
    }

    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Deliver `message` to the primary client. Returns whether it was sent.
    pub async fn send_to_primary(&self, message: &ServerMessage) -> bool {
        let Some(visitor_id) = self.primary().await else {
            debug!("No primary client for server-initiated message");
            return false;
        };
        let Some(sink) = self.get(&visitor_id).await else {
            return false;
        };
        match sink.send(message).await {
            Ok(()) => true,
            Err(e) => {
                warn!(visitor_id = %visitor_id, error = %e, "Failed to reach primary client");
                false
            }
        }
    }

    /// Ask the primary client to re-verify the user. The receiver resolves
    /// with the client's `reverify-result`.
    pub async fn request_reverify(&self) -> Option<oneshot::Receiver<bool>> {
        let request_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.reverify.write().await.insert(request_id.clone(), tx);
        let message = ServerMessage::Reverify {
            request_id: request_id.clone(),
        };
        if self.send_to_primary(&message).await {
            Some(rx)
        } else {
            self.reverify.write().await.remove(&request_id);
            None
        }
    }

    /// Complete a pending re-verification. Returns whether one was waiting.
    pub async fn resolve_reverify(&self, request_id: &str, verified: bool) -> bool {
        let Some(tx) = self.reverify.write().await.remove(request_id) else {
            warn!(request_id, "Unknown re-verification result");
            return false;
        };
        tx.send(verified).is_ok()
    }
}
