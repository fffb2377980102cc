use std::collections::HashMap;

use chrono::Utc;
use log::warn;
use serde::{Deserialize, Serialize};
use sqlx::Row;
use uuid::Uuid;

use crate::server::cache::{self, RedisCache};
use crate::server::database::Database;
use crate::server::error::{is_unique_violation, ServiceError};
use crate::server::hub::{Hub, WsMessage};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reaction {
    pub message_id: String,
    pub user_id: String,
    pub emoji: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub content: String,
    pub created_at: i64,
    pub read_at: Option<i64>,
    pub expires_at: Option<i64>,
    pub reactions: Vec<Reaction>,
}

#[derive(Debug, Clone)]
pub struct SendMessageRequest {
    pub receiver_id: String,
    pub content: String,
    /// Disappearing messages: seconds until the sweeper removes it.
    pub expires_in_seconds: Option<i64>,
}

/// Gate for sending and for reading history. Passes only when no block
/// exists in either direction, the connection is accepted, and the target
/// has not set messaging to `nobody`. Every deny looks the same to the
/// caller, so a block is indistinguishable from a missing connection.
pub async fn check_connection(
    db: &Database,
    user_id: &str,
    target_id: &str,
) -> Result<(), ServiceError> {
    let denied = ServiceError::Forbidden("you must be connected to this user to chat".into());

    let blocked = sqlx::query(
        "SELECT 1 FROM blocks WHERE (blocker_id = ? AND blocked_id = ?) OR (blocker_id = ? AND blocked_id = ?)",
    )
    .bind(user_id)
    .bind(target_id)
    .bind(target_id)
    .bind(user_id)
    .fetch_optional(&db.pool)
    .await?;
    if blocked.is_some() {
        return Err(denied);
    }

    let connection = sqlx::query(
        "SELECT status FROM connections WHERE (requester_id = ? AND target_id = ?) OR (requester_id = ? AND target_id = ?)",
    )
    .bind(user_id)
    .bind(target_id)
    .bind(target_id)
    .bind(user_id)
    .fetch_optional(&db.pool)
    .await?;
    match connection {
        Some(row) => {
            let status: String = row.get("status");
            if status != "accepted" {
                return Err(denied);
            }
        }
        None => return Err(denied),
    }

    // Privacy settings of the target; absent row means the defaults apply
    // (who_can_message = connections, satisfied by the accepted connection).
    let settings = sqlx::query("SELECT who_can_message FROM privacy_settings WHERE user_id = ?")
        .bind(target_id)
        .fetch_optional(&db.pool)
        .await?;
    if let Some(row) = settings {
        let who_can_message: String = row.get("who_can_message");
        if who_can_message == "nobody" {
            return Err(denied);
        }
    }

    Ok(())
}

pub async fn send_message(
    db: &Database,
    kv: &RedisCache,
    hub: &Hub,
    sender_id: &str,
    req: SendMessageRequest,
) -> Result<Message, ServiceError> {
    if req.content.is_empty() {
        return Err(ServiceError::Validation("content must not be empty".into()));
    }

    check_connection(db, sender_id, &req.receiver_id).await?;

    let now = Utc::now().timestamp();
    let expires_at = req
        .expires_in_seconds
        .filter(|secs| *secs > 0)
        .map(|secs| now + secs);

    let message = Message {
        id: Uuid::new_v4().to_string(),
        sender_id: sender_id.to_string(),
        receiver_id: req.receiver_id.clone(),
        content: req.content,
        created_at: now,
        read_at: None,
        expires_at,
        reactions: Vec::new(),
    };

    sqlx::query(
        "INSERT INTO messages (id, sender_id, receiver_id, content, created_at, expires_at) VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(&message.id)
    .bind(&message.sender_id)
    .bind(&message.receiver_id)
    .bind(&message.content)
    .bind(message.created_at)
    .bind(message.expires_at)
    .execute(&db.pool)
    .await?;

    // Cache bookkeeping is best-effort from here on; the row is committed.
    invalidate_conversation(kv, sender_id, &req.receiver_id).await;
    if let Err(e) = kv.incr(&cache::unread_count_key(&req.receiver_id)).await {
        warn!("[CACHE] unread incr failed for {}: {}", req.receiver_id, e);
    }

    let frame = WsMessage::new("new_message", serde_json::to_value(&message).unwrap_or_default())
        .with_sender(sender_id, now);
    // Receiver's devices, and the sender's other devices too.
    hub.send_ws(&req.receiver_id, &frame).await;
    hub.send_ws(sender_id, &frame).await;

    Ok(message)
}

/// Full conversation between two users, oldest first, behind a 10-minute
/// read-through cache. Gated like sending: a target that flips to `nobody`
/// hides history as well as new intake.
pub async fn get_conversation(
    db: &Database,
    kv: &RedisCache,
    user_id: &str,
    other_id: &str,
) -> Result<Vec<Message>, ServiceError> {
    check_connection(db, user_id, other_id).await?;

    let cache_key = cache::conversation_key(user_id, other_id);
    if let Ok(Some(cached)) = kv.get(&cache_key).await {
        if let Ok(messages) = serde_json::from_str::<Vec<Message>>(&cached) {
            return Ok(messages);
        }
    }

    let now = Utc::now().timestamp();
    let rows = sqlx::query(
        r#"
        SELECT id, sender_id, receiver_id, content, created_at, read_at, expires_at
        FROM messages
        WHERE ((sender_id = ?1 AND receiver_id = ?2) OR (sender_id = ?2 AND receiver_id = ?1))
          AND (expires_at IS NULL OR expires_at > ?3)
        ORDER BY created_at ASC
    "#,
    )
    .bind(user_id)
    .bind(other_id)
    .bind(now)
    .fetch_all(&db.pool)
    .await?;

    let reaction_rows = sqlx::query(
        r#"
        SELECT r.message_id, r.user_id, r.emoji, r.created_at
        FROM message_reactions r
        JOIN messages m ON m.id = r.message_id
        WHERE (m.sender_id = ?1 AND m.receiver_id = ?2) OR (m.sender_id = ?2 AND m.receiver_id = ?1)
    "#,
    )
    .bind(user_id)
    .bind(other_id)
    .fetch_all(&db.pool)
    .await?;

    let mut reactions: HashMap<String, Vec<Reaction>> = HashMap::new();
    for row in reaction_rows {
        let reaction = Reaction {
            message_id: row.get("message_id"),
            user_id: row.get("user_id"),
            emoji: row.get("emoji"),
            created_at: row.get("created_at"),
        };
        reactions
            .entry(reaction.message_id.clone())
            .or_default()
            .push(reaction);
    }

    let messages: Vec<Message> = rows
        .into_iter()
        .map(|row| {
            let id: String = row.get("id");
            let message_reactions = reactions.remove(&id).unwrap_or_default();
            Message {
                id,
                sender_id: row.get("sender_id"),
                receiver_id: row.get("receiver_id"),
                content: row.get("content"),
                created_at: row.get("created_at"),
                read_at: row.get("read_at"),
                expires_at: row.get("expires_at"),
                reactions: message_reactions,
            }
        })
        .collect();

    if let Ok(json) = serde_json::to_string(&messages) {
        if let Err(e) = kv.set_ex(&cache_key, &json, cache::CONVERSATION_TTL).await {
            warn!("[CACHE] conversation cache write failed: {}", e);
        }
    }

    Ok(messages)
}

async fn fetch_message(db: &Database, message_id: &str) -> Result<Message, ServiceError> {
    let row = sqlx::query(
        "SELECT id, sender_id, receiver_id, content, created_at, read_at, expires_at FROM messages WHERE id = ?",
    )
    .bind(message_id)
    .fetch_optional(&db.pool)
    .await?;
    let Some(row) = row else {
        return Err(ServiceError::NotFound("message"));
    };
    Ok(Message {
        id: row.get("id"),
        sender_id: row.get("sender_id"),
        receiver_id: row.get("receiver_id"),
        content: row.get("content"),
        created_at: row.get("created_at"),
        read_at: row.get("read_at"),
        expires_at: row.get("expires_at"),
        reactions: Vec::new(),
    })
}

pub async fn edit_message(
    db: &Database,
    kv: &RedisCache,
    hub: &Hub,
    user_id: &str,
    message_id: &str,
    content: &str,
) -> Result<Message, ServiceError> {
    if content.is_empty() {
        return Err(ServiceError::Validation("content must not be empty".into()));
    }

    let mut message = fetch_message(db, message_id).await?;
    if message.sender_id != user_id {
        return Err(ServiceError::Forbidden(
            "you can only edit your own messages".into(),
        ));
    }

    sqlx::query("UPDATE messages SET content = ? WHERE id = ? AND sender_id = ?")
        .bind(content)
        .bind(message_id)
        .bind(user_id)
        .execute(&db.pool)
        .await?;
    message.content = content.to_string();

    invalidate_conversation(kv, &message.sender_id, &message.receiver_id).await;

    let frame = WsMessage::new(
        "message_edited",
        serde_json::to_value(&message).unwrap_or_default(),
    );
    hub.send_ws(&message.receiver_id, &frame).await;

    Ok(message)
}

pub async fn delete_message(
    db: &Database,
    kv: &RedisCache,
    hub: &Hub,
    user_id: &str,
    message_id: &str,
) -> Result<(), ServiceError> {
    let message = fetch_message(db, message_id).await?;
    if message.sender_id != user_id {
        return Err(ServiceError::Forbidden(
            "you can only delete your own messages".into(),
        ));
    }

    sqlx::query("DELETE FROM messages WHERE id = ? AND sender_id = ?")
        .bind(message_id)
        .bind(user_id)
        .execute(&db.pool)
        .await?;

    invalidate_conversation(kv, &message.sender_id, &message.receiver_id).await;

    let frame = WsMessage::new(
        "message_deleted",
        serde_json::json!({ "message_id": message_id }),
    );
    hub.send_ws(&message.receiver_id, &frame).await;

    Ok(())
}

pub async fn add_reaction(
    db: &Database,
    kv: &RedisCache,
    hub: &Hub,
    user_id: &str,
    message_id: &str,
    emoji: &str,
) -> Result<Reaction, ServiceError> {
    let message = fetch_message(db, message_id).await?;

    let reaction = Reaction {
        message_id: message_id.to_string(),
        user_id: user_id.to_string(),
        emoji: emoji.to_string(),
        created_at: Utc::now().timestamp(),
    };

    let result = sqlx::query(
        "INSERT INTO message_reactions (message_id, user_id, emoji, created_at) VALUES (?, ?, ?, ?)",
    )
    .bind(&reaction.message_id)
    .bind(&reaction.user_id)
    .bind(&reaction.emoji)
    .bind(reaction.created_at)
    .execute(&db.pool)
    .await;
    if let Err(e) = result {
        if is_unique_violation(&e) {
            return Err(ServiceError::Conflict("reaction already exists".into()));
        }
        return Err(e.into());
    }

    invalidate_conversation(kv, &message.sender_id, &message.receiver_id).await;

    let other_id = other_participant(&message, user_id);
    let frame = WsMessage::new(
        "reaction_added",
        serde_json::json!({
            "message_id": message_id,
            "user_id": user_id,
            "emoji": emoji,
        }),
    );
    hub.send_ws(other_id, &frame).await;

    Ok(reaction)
}

pub async fn remove_reaction(
    db: &Database,
    kv: &RedisCache,
    hub: &Hub,
    user_id: &str,
    message_id: &str,
    emoji: &str,
) -> Result<(), ServiceError> {
    let message = fetch_message(db, message_id).await?;

    sqlx::query("DELETE FROM message_reactions WHERE message_id = ? AND user_id = ? AND emoji = ?")
        .bind(message_id)
        .bind(user_id)
        .bind(emoji)
        .execute(&db.pool)
        .await?;

    invalidate_conversation(kv, &message.sender_id, &message.receiver_id).await;

    let other_id = other_participant(&message, user_id);
    let frame = WsMessage::new(
        "reaction_removed",
        serde_json::json!({
            "message_id": message_id,
            "user_id": user_id,
            "emoji": emoji,
        }),
    );
    hub.send_ws(other_id, &frame).await;

    Ok(())
}

/// Mark every unread message from `sender_id` to the reader as read. The
/// reader's unread counter is deleted (not decremented) so the next badge
/// read recounts from the database.
pub async fn mark_conversation_read(
    db: &Database,
    kv: &RedisCache,
    hub: &Hub,
    reader_id: &str,
    sender_id: &str,
) -> Result<(), ServiceError> {
    sqlx::query(
        "UPDATE messages SET read_at = ? WHERE receiver_id = ? AND sender_id = ? AND read_at IS NULL",
    )
    .bind(Utc::now().timestamp())
    .bind(reader_id)
    .bind(sender_id)
    .execute(&db.pool)
    .await?;

    invalidate_conversation(kv, reader_id, sender_id).await;
    if let Err(e) = kv.del(&cache::unread_count_key(reader_id)).await {
        warn!("[CACHE] unread invalidation failed for {}: {}", reader_id, e);
    }

    let frame = WsMessage::new(
        "messages_read",
        serde_json::json!({
            "reader_id": reader_id,
            "sender_id": sender_id,
        }),
    );
    // The sender's "seen" indicators, and the reader's other devices for
    // badge sync.
    hub.send_ws(sender_id, &frame).await;
    hub.send_ws(reader_id, &frame).await;

    Ok(())
}

pub async fn get_unread_count(
    db: &Database,
    kv: &RedisCache,
    user_id: &str,
) -> Result<i64, ServiceError> {
    let cache_key = cache::unread_count_key(user_id);
    if let Ok(Some(count)) = kv.get_i64(&cache_key).await {
        return Ok(count);
    }

    let now = Utc::now().timestamp();
    let row = sqlx::query(
        "SELECT COUNT(*) AS unread FROM messages WHERE receiver_id = ? AND read_at IS NULL AND (expires_at IS NULL OR expires_at > ?)",
    )
    .bind(user_id)
    .bind(now)
    .fetch_one(&db.pool)
    .await?;
    let count: i64 = row.get("unread");

    if let Err(e) = kv
        .set_ex(&cache_key, &count.to_string(), cache::UNREAD_COUNT_TTL)
        .await
    {
        warn!("[CACHE] unread count cache write failed: {}", e);
    }

    Ok(count)
}

/// Remove every message between the two users, in both directions.
pub async fn delete_conversation(
    db: &Database,
    kv: &RedisCache,
    user_id: &str,
    other_id: &str,
) -> Result<(), ServiceError> {
    sqlx::query(
        "DELETE FROM messages WHERE (sender_id = ?1 AND receiver_id = ?2) OR (sender_id = ?2 AND receiver_id = ?1)",
    )
    .bind(user_id)
    .bind(other_id)
    .execute(&db.pool)
    .await?;

    invalidate_conversation(kv, user_id, other_id).await;
    if let Err(e) = kv.del(&cache::unread_count_key(user_id)).await {
        warn!("[CACHE] unread invalidation failed for {}: {}", user_id, e);
    }

    Ok(())
}

fn other_participant<'a>(message: &'a Message, user_id: &str) -> &'a str {
    if message.sender_id == user_id {
        &message.receiver_id
    } else {
        &message.sender_id
    }
}

async fn invalidate_conversation(kv: &RedisCache, user_id1: &str, user_id2: &str) {
    let key = cache::conversation_key(user_id1, user_id2);
    if let Err(e) = kv.del(&key).await {
        warn!("[CACHE] conversation invalidation failed for {}: {}", key, e);
    }
}
