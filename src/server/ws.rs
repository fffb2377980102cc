use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{error, info, warn};
use serde::Deserialize;
use sqlx::Row;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, Instant};
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::server::database::Database;
use crate::server::hub::{ClientHandle, Hub, WsMessage, SEND_QUEUE_CAPACITY};

/// A connection that stays silent (no frames, no pongs) this long is dead.
const READ_TIMEOUT: Duration = Duration::from_secs(60);
/// Per-flush write deadline.
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);
/// Ping cadence; must beat the read timeout with margin.
const PING_PERIOD: Duration = Duration::from_secs(54);
/// Inbound frames are small control messages; anything bigger is abuse.
const MAX_FRAME_BYTES: usize = 4096;

/// Frames a client may send. Only `typing` is acted on.
#[derive(Debug, Deserialize)]
struct InboundFrame {
    #[serde(rename = "type")]
    message_type: String,
    receiver_id: Option<String>,
}

/// Accept loop for chat sockets. Stops accepting when the shutdown signal
/// flips; established connections drain on their own pumps.
pub async fn run_ws_server(
    addr: &str,
    hub: Arc<Hub>,
    db: Arc<Database>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("[WS] listening on {}", addr);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let hub = hub.clone();
                        let db = db.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, hub, db).await {
                                warn!("[WS] connection from {} ended with error: {}", peer, e);
                            }
                        });
                    }
                    Err(e) => warn!("[WS] accept failed: {}", e),
                }
            }
            _ = shutdown.changed() => {
                info!("[WS] no longer accepting connections");
                break;
            }
        }
    }

    Ok(())
}

async fn handle_connection(
    stream: TcpStream,
    hub: Arc<Hub>,
    db: Arc<Database>,
) -> anyhow::Result<()> {
    let mut token: Option<String> = None;
    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(MAX_FRAME_BYTES);
    config.max_frame_size = Some(MAX_FRAME_BYTES);

    let mut ws_stream = tokio_tungstenite::accept_hdr_async_with_config(
        stream,
        |req: &Request, resp: Response| {
            token = extract_token(req);
            Ok(resp)
        },
        Some(config),
    )
    .await?;

    let authenticated = match token {
        Some(token) => authenticate_session(&db, &token).await,
        None => None,
    };
    let Some((user_id, username)) = authenticated else {
        // Same handling as HTTP: no valid bearer, no session.
        let _ = ws_stream.close(None).await;
        return Ok(());
    };

    let (ws_sender, ws_receiver) = ws_stream.split();
    let (tx, rx) = mpsc::channel::<Message>(SEND_QUEUE_CAPACITY);
    let client_id = Uuid::new_v4().to_string();
    hub.register(&user_id, &client_id, ClientHandle::new(username.clone(), tx))
        .await;

    let mut write_task = tokio::spawn(write_pump(ws_sender, rx));
    let mut read_task = tokio::spawn(read_pump(
        ws_receiver,
        hub.clone(),
        user_id.clone(),
        username,
    ));

    tokio::select! {
        _ = &mut write_task => {
            read_task.abort();
            hub.unregister(&user_id, &client_id).await;
        }
        _ = &mut read_task => {
            // Unregistering drops the queue sender; the write pump drains
            // what is buffered, sends the close frame and exits.
            hub.unregister(&user_id, &client_id).await;
            let _ = tokio::time::timeout(Duration::from_secs(5), &mut write_task).await;
            write_task.abort();
        }
    }

    Ok(())
}

/// Bearer token from the Authorization header, or `?token=` in the upgrade
/// URI (browsers cannot set headers on WebSocket upgrades).
fn extract_token(req: &Request) -> Option<String> {
    if let Some(value) = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
    {
        let mut fields = value.split_whitespace();
        if let (Some(scheme), Some(token)) = (fields.next(), fields.next()) {
            if scheme.eq_ignore_ascii_case("bearer") {
                return Some(token.to_string());
            }
        }
    }

    req.uri().query().and_then(|query| {
        query
            .split('&')
            .find_map(|pair| pair.strip_prefix("token="))
            .filter(|t| !t.is_empty())
            .map(|t| t.to_string())
    })
}

async fn authenticate_session(db: &Database, token: &str) -> Option<(String, String)> {
    let result = sqlx::query(
        "SELECT s.user_id, u.username FROM sessions s JOIN users u ON u.id = s.user_id WHERE s.session_token = ? AND s.expires_at > ?",
    )
    .bind(token)
    .bind(Utc::now().timestamp())
    .fetch_optional(&db.pool)
    .await;

    match result {
        Ok(Some(row)) => Some((row.get("user_id"), row.get("username"))),
        Ok(None) => None,
        Err(e) => {
            error!("[WS] session lookup failed: {}", e);
            None
        }
    }
}

/// Drain the send queue onto the socket. Frames already queued behind the
/// one being written are batched into the same flush. A closed queue means
/// the hub evicted us or the connection is going away: say goodbye and exit.
async fn write_pump(
    mut sender: SplitSink<WebSocketStream<TcpStream>, Message>,
    mut rx: mpsc::Receiver<Message>,
) {
    let mut ping = interval_at(Instant::now() + PING_PERIOD, PING_PERIOD);

    loop {
        tokio::select! {
            frame = rx.recv() => match frame {
                Some(frame) => {
                    let flush = async {
                        sender.feed(frame).await?;
                        while let Ok(extra) = rx.try_recv() {
                            sender.feed(extra).await?;
                        }
                        sender.flush().await
                    };
                    match tokio::time::timeout(WRITE_TIMEOUT, flush).await {
                        Ok(Ok(())) => {}
                        _ => return,
                    }
                }
                None => {
                    let _ = tokio::time::timeout(
                        WRITE_TIMEOUT,
                        sender.send(Message::Close(None)),
                    )
                    .await;
                    return;
                }
            },
            _ = ping.tick() => {
                match tokio::time::timeout(WRITE_TIMEOUT, sender.send(Message::Ping(Vec::new()))).await {
                    Ok(Ok(())) => {}
                    _ => return,
                }
            }
        }
    }
}

/// Read frames until error, close or deadline. The deadline advances only
/// when the peer answers a ping; data frames do not extend it, so a client
/// that floods messages without ever ponging still dies. Only `typing`
/// frames are meaningful; they are forwarded to the declared receiver.
async fn read_pump(
    mut receiver: SplitStream<WebSocketStream<TcpStream>>,
    hub: Arc<Hub>,
    user_id: String,
    username: String,
) {
    let mut deadline = Instant::now() + READ_TIMEOUT;
    loop {
        let frame = match tokio::time::timeout_at(deadline, receiver.next()).await {
            Err(_) => {
                warn!("[WS] read deadline exceeded for user {}", user_id);
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(_))) => break,
            Ok(Some(Ok(frame))) => frame,
        };

        match frame {
            Message::Pong(_) => deadline = Instant::now() + READ_TIMEOUT,
            Message::Text(text) => {
                if let Ok(inbound) = serde_json::from_str::<InboundFrame>(&text) {
                    if inbound.message_type == "typing" {
                        if let Some(receiver_id) = inbound.receiver_id {
                            let typing = WsMessage::new(
                                "typing",
                                serde_json::json!({
                                    "user_id": user_id,
                                    "username": username,
                                }),
                            );
                            hub.send_ws(&receiver_id, &typing).await;
                        }
                    }
                }
                // everything else inbound is ignored
            }
            Message::Close(_) => break,
            // Pings are answered by the protocol layer
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upgrade_request(uri: &str, auth: Option<&str>) -> Request {
        use tokio_tungstenite::tungstenite::http;

        let mut builder = http::Request::builder()
            .method("GET")
            .uri(uri)
            .header("host", "localhost")
            .header("connection", "Upgrade")
            .header("upgrade", "websocket")
            .header("sec-websocket-version", "13")
            .header("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ==");
        if let Some(auth) = auth {
            builder = builder.header("authorization", auth);
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn token_comes_from_bearer_header() {
        let req = upgrade_request("/ws/chat", Some("Bearer abc123"));
        assert_eq!(extract_token(&req), Some("abc123".to_string()));
    }

    #[test]
    fn token_falls_back_to_query_param() {
        let req = upgrade_request("/ws/chat?token=qtoken", None);
        assert_eq!(extract_token(&req), Some("qtoken".to_string()));

        let req = upgrade_request("/ws/chat?foo=1&token=second", None);
        assert_eq!(extract_token(&req), Some("second".to_string()));
    }

    #[test]
    fn missing_token_is_none() {
        let req = upgrade_request("/ws/chat", None);
        assert_eq!(extract_token(&req), None);

        let req = upgrade_request("/ws/chat?token=", None);
        assert_eq!(extract_token(&req), None);

        let req = upgrade_request("/ws/chat", Some("Basic abc"));
        assert_eq!(extract_token(&req), None);
    }
}
