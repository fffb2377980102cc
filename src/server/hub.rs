use std::collections::HashMap;

use log::{info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;

/// Per-client outbound queue depth. A client that lets this fill up is a
/// slow consumer and gets evicted; it reconnects and refetches state.
pub const SEND_QUEUE_CAPACITY: usize = 256;

/// Envelope for every frame pushed over a chat socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsMessage {
    #[serde(rename = "type")]
    pub message_type: String,
    pub payload: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<i64>,
}

impl WsMessage {
    pub fn new(message_type: &str, payload: serde_json::Value) -> Self {
        Self {
            message_type: message_type.to_string(),
            payload,
            sender_id: None,
            created_at: None,
        }
    }

    pub fn with_sender(mut self, sender_id: &str, created_at: i64) -> Self {
        self.sender_id = Some(sender_id.to_string());
        self.created_at = Some(created_at);
        self
    }
}

pub struct ClientHandle {
    pub username: String,
    sender: mpsc::Sender<Message>,
}

impl ClientHandle {
    pub fn new(username: String, sender: mpsc::Sender<Message>) -> Self {
        Self { username, sender }
    }
}

/// Registry of live WebSocket clients, keyed by user then client id. A user
/// may hold several simultaneous connections (phone + web). Registration
/// takes the write lock; fan-out takes the read lock.
pub struct Hub {
    clients: RwLock<HashMap<String, HashMap<String, ClientHandle>>>,
}

impl Hub {
    pub fn new() -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
        }
    }

    pub async fn register(&self, user_id: &str, client_id: &str, handle: ClientHandle) {
        let mut clients = self.clients.write().await;
        let username = handle.username.clone();
        clients
            .entry(user_id.to_string())
            .or_default()
            .insert(client_id.to_string(), handle);
        info!("[HUB] client registered: {} ({})", username, client_id);
    }

    pub async fn unregister(&self, user_id: &str, client_id: &str) {
        let mut clients = self.clients.write().await;
        if let Some(user_clients) = clients.get_mut(user_id) {
            user_clients.remove(client_id);
            if user_clients.is_empty() {
                clients.remove(user_id);
            }
        }
        info!("[HUB] client unregistered: {}", client_id);
    }

    /// Deliver a frame to every connection the user holds. Non-blocking: a
    /// full or closed queue evicts that connection rather than waiting on it.
    pub async fn send_to_user(&self, user_id: &str, message: Message) {
        let mut evicted: Vec<String> = Vec::new();
        {
            let clients = self.clients.read().await;
            let Some(user_clients) = clients.get(user_id) else {
                return;
            };
            for (client_id, handle) in user_clients {
                if handle.sender.try_send(message.clone()).is_err() {
                    warn!(
                        "[HUB] send queue full or closed, evicting client {} of user {}",
                        client_id, user_id
                    );
                    evicted.push(client_id.clone());
                }
            }
        }
        if !evicted.is_empty() {
            let mut clients = self.clients.write().await;
            if let Some(user_clients) = clients.get_mut(user_id) {
                for client_id in &evicted {
                    // Dropping the handle drops the queue's sender; the write
                    // pump drains what is buffered, then closes the socket.
                    user_clients.remove(client_id);
                }
                if user_clients.is_empty() {
                    clients.remove(user_id);
                }
            }
        }
    }

    /// Serialize an envelope and deliver it to the user.
    pub async fn send_ws(&self, user_id: &str, message: &WsMessage) {
        match serde_json::to_string(message) {
            Ok(json) => self.send_to_user(user_id, Message::Text(json)).await,
            Err(e) => warn!("[HUB] failed to encode ws frame: {}", e),
        }
    }

    pub async fn connection_count(&self, user_id: &str) -> usize {
        let clients = self.clients.read().await;
        clients.get(user_id).map(|c| c.len()).unwrap_or(0)
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(username: &str) -> (ClientHandle, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(SEND_QUEUE_CAPACITY);
        (ClientHandle::new(username.to_string(), tx), rx)
    }

    #[tokio::test]
    async fn fan_out_reaches_every_device_of_a_user() {
        let hub = Hub::new();
        let (phone, mut phone_rx) = handle("ada");
        let (web, mut web_rx) = handle("ada");
        hub.register("u1", "c1", phone).await;
        hub.register("u1", "c2", web).await;

        hub.send_ws("u1", &WsMessage::new("messages_read", serde_json::json!({})))
            .await;

        assert!(phone_rx.try_recv().is_ok());
        assert!(web_rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn send_to_unknown_user_is_a_no_op() {
        let hub = Hub::new();
        hub.send_to_user("nobody", Message::Text("x".into())).await;
    }

    #[tokio::test]
    async fn unregister_forgets_the_connection() {
        let hub = Hub::new();
        let (h, mut rx) = handle("ada");
        hub.register("u1", "c1", h).await;
        hub.unregister("u1", "c1").await;
        assert_eq!(hub.connection_count("u1").await, 0);

        hub.send_to_user("u1", Message::Text("x".into())).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn slow_consumer_is_evicted_not_waited_on() {
        let hub = Hub::new();
        let (tx, _rx) = mpsc::channel(1);
        hub.register("u1", "c1", ClientHandle::new("ada".into(), tx))
            .await;

        // First frame fills the 1-slot queue, second one trips the eviction.
        hub.send_to_user("u1", Message::Text("a".into())).await;
        hub.send_to_user("u1", Message::Text("b".into())).await;
        assert_eq!(hub.connection_count("u1").await, 0);
    }

    #[test]
    fn envelope_serializes_with_wire_field_names() {
        let msg = WsMessage::new("new_message", serde_json::json!({"id": "m1"}))
            .with_sender("u1", 1_700_000_000);
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"new_message\""));
        assert!(json.contains("\"sender_id\":\"u1\""));

        let bare = WsMessage::new("typing", serde_json::json!({}));
        let json = serde_json::to_string(&bare).unwrap();
        assert!(!json.contains("sender_id"));
        assert!(!json.contains("created_at"));
    }
}
