use chrono::Utc;
use log::{error, warn};

use crate::server::crossing::CrossingDetector;
use crate::server::database::Database;
use crate::server::error::ServiceError;
use crate::server::geo;
use crate::server::hub::Hub;
use crate::server::safety::{LastLocationStore, SafetyMonitor};

/// What happened to a ping. Both variants answer HTTP 200 upstream; a
/// spoofed sample must look exactly like an accepted one to its sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Accepted,
    SilentlyDropped,
}

/// Ingest one geo sample: coarsen, safety-gate, persist, hand to the
/// detector.
pub async fn update_location<S: LastLocationStore>(
    db: &Database,
    safety: &SafetyMonitor<S>,
    detector: &CrossingDetector,
    hub: &Hub,
    user_id: &str,
    lat: f64,
    lng: f64,
) -> Result<IngestOutcome, ServiceError> {
    if !(-90.0..=90.0).contains(&lat) {
        return Err(ServiceError::Validation("latitude out of range".into()));
    }
    if !(-180.0..=180.0).contains(&lng) {
        return Err(ServiceError::Validation("longitude out of range".into()));
    }

    let hash = geo::encode_geohash(lat, lng, geo::LOCATION_PRECISION)
        .map_err(|e| ServiceError::Validation(e.to_string()))?;

    let validation = safety.validate(user_id, lat, lng).await;
    if !validation.allowed {
        if validation.should_ban {
            sqlx::query("UPDATE users SET is_shadow_banned = 1 WHERE id = ?")
                .bind(user_id)
                .execute(&db.pool)
                .await?;
            warn!(
                "[SAFETY] user {} shadow-banned for fake GPS: {}",
                user_id,
                validation.reason.as_deref().unwrap_or("unknown")
            );
        }
        // Keep the illusion of success; the fake sample is never persisted.
        return Ok(IngestOutcome::SilentlyDropped);
    }

    let now = Utc::now().timestamp();
    sqlx::query(
        "INSERT INTO locations (user_id, geohash, lat, lng, time_bucket, created_at, expires_at) VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(user_id)
    .bind(&hash)
    .bind(lat)
    .bind(lng)
    .bind(geo::time_bucket(now))
    .bind(now)
    .bind(now + geo::LOCATION_TTL_SECONDS)
    .execute(&db.pool)
    .await?;

    // Activity timestamp feeds the visibility system; losing one update is
    // not worth failing the ping.
    if let Err(e) = sqlx::query("UPDATE users SET last_active_at = ? WHERE id = ?")
        .bind(now)
        .bind(user_id)
        .execute(&db.pool)
        .await
    {
        error!("[LOCATION] failed to update last_active_at for {}: {}", user_id, e);
    }

    // Synchronous hand-off to the detector. Detection is at-least-once; the
    // dedup window makes retries idempotent, so a failure here is logged and
    // the ping still succeeds.
    if let Err(e) = detector.on_ping(hub, user_id, lat, lng).await {
        error!("[LOCATION] crossing detection failed for {}: {}", user_id, e);
    }

    Ok(IngestOutcome::Accepted)
}
