use chrono::Utc;
use log::error;
use uuid::Uuid;

use crate::server::database::Database;
use crate::server::hub::{Hub, WsMessage};

pub struct NotificationParams<'a> {
    pub user_id: &'a str,
    pub kind: &'a str,
    pub title: &'a str,
    pub message: &'a str,
    pub related_user_id: Option<&'a str>,
    pub related_crossing_id: Option<&'a str>,
    pub related_story_id: Option<&'a str>,
}

/// Insert a notification row, returning its id.
pub async fn create_notification(
    db: &Database,
    params: NotificationParams<'_>,
) -> Result<String, sqlx::Error> {
    let id = Uuid::new_v4().to_string();
    sqlx::query(
        r#"
        INSERT INTO notifications
            (id, user_id, type, title, message, related_user_id, related_crossing_id, related_story_id, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
    "#,
    )
    .bind(&id)
    .bind(params.user_id)
    .bind(params.kind)
    .bind(params.title)
    .bind(params.message)
    .bind(params.related_user_id)
    .bind(params.related_crossing_id)
    .bind(params.related_story_id)
    .bind(Utc::now().timestamp())
    .execute(&db.pool)
    .await?;
    Ok(id)
}

/// Notify one side of a fresh crossing: a persisted notification row plus a
/// `crossing_detected` frame for any live connections. Both are best-effort
/// from the detector's point of view; failures are logged and swallowed.
pub async fn notify_crossing(
    db: &Database,
    hub: &Hub,
    recipient_id: &str,
    crossed_with_id: &str,
    crossing_id: &str,
) {
    let params = NotificationParams {
        user_id: recipient_id,
        kind: "crossing_detected",
        title: "Path Crossed!",
        message: "You crossed paths with someone nearby",
        related_user_id: Some(crossed_with_id),
        related_crossing_id: Some(crossing_id),
        related_story_id: None,
    };
    if let Err(e) = create_notification(db, params).await {
        error!(
            "[CROSSING] failed to create notification for user {}: {}",
            recipient_id, e
        );
    }

    let frame = WsMessage::new(
        "crossing_detected",
        serde_json::json!({
            "crossing_id": crossing_id,
            "user_id": crossed_with_id,
        }),
    );
    hub.send_ws(recipient_id, &frame).await;
}
