use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use sqlx::Row;
use uuid::Uuid;

use crate::server::cache::{self, RedisCache};
use crate::server::database::Database;
use crate::server::error::ServiceError;
use crate::server::geo;
use crate::server::hub::Hub;
use crate::server::notifications;

/// Radius for "crossing paths". Chosen to line up with the geohash7 cell
/// diagonal (~76 m): wide enough to catch pairs split across a cell edge,
/// tight enough not to invent crossings a street apart.
pub const CROSSING_RADIUS_METERS: f64 = 80.0;

/// A pair gets at most one crossing row inside this sliding window. Matches
/// the TTL of the KV dedup key.
pub const DEDUP_WINDOW_SECONDS: i64 = 24 * 3600;

/// Canonical unordered pair: lexicographic string order, smaller id first.
pub fn canonical_pair<'a>(a: &'a str, b: &'a str) -> (&'a str, &'a str) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

/// Insert a crossing row unless the pair already has one inside the 24 h
/// window trailing `occurred_at`. Returns `Ok(None)` for the duplicate case,
/// the expected outcome of a dedup race. The check and the insert share one
/// transaction so concurrent pings from both sides of the pair cannot both
/// commit.
pub async fn record_crossing(
    db: &Database,
    user_id1: &str,
    user_id2: &str,
    location_center: &str,
    occurred_at: i64,
) -> Result<Option<String>, sqlx::Error> {
    let mut tx = db.pool.begin().await?;

    let recent = sqlx::query(
        "SELECT 1 FROM crossings WHERE user_id1 = ? AND user_id2 = ? AND occurred_at > ?",
    )
    .bind(user_id1)
    .bind(user_id2)
    .bind(occurred_at - DEDUP_WINDOW_SECONDS)
    .fetch_optional(&mut *tx)
    .await?;
    if recent.is_some() {
        return Ok(None);
    }

    let id = Uuid::new_v4().to_string();
    sqlx::query(
        "INSERT INTO crossings (id, user_id1, user_id2, location_center, occurred_at) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(user_id1)
    .bind(user_id2)
    .bind(location_center)
    .bind(occurred_at)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;

    Ok(Some(id))
}

/// Live path-crossing engine. Owns the geo index of recently-active users
/// and runs the at-most-once-per-pair-per-window notification flow.
pub struct CrossingDetector {
    db: Arc<Database>,
    kv: Arc<RedisCache>,
}

impl CrossingDetector {
    pub fn new(db: Arc<Database>, kv: Arc<RedisCache>) -> Self {
        Self { db, kv }
    }

    /// Called synchronously from the ingest path for every accepted ping.
    pub async fn on_ping(
        &self,
        hub: &Hub,
        user_id: &str,
        lat: f64,
        lng: f64,
    ) -> anyhow::Result<()> {
        // 1. Refresh the user's position in the geo index
        self.kv
            .geo_add(cache::USER_LOCATIONS_KEY, lat, lng, user_id)
            .await?;

        // 2. Who else is within the crossing radius right now?
        let matches = match self
            .kv
            .geo_radius(cache::USER_LOCATIONS_KEY, lat, lng, CROSSING_RADIUS_METERS)
            .await
        {
            Ok(matches) => matches,
            Err(e) => {
                // The index write succeeded; losing one radius query only
                // delays detection until the next ping or the sweeper.
                error!("[CROSSING] radius query failed: {}", e);
                return Ok(());
            }
        };

        for m in matches {
            let other_id = m.name.as_str();
            if other_id == user_id {
                continue;
            }

            let (lat, lng) = match m.coord.as_ref() {
                Some(c) => (c.latitude, c.longitude),
                None => (lat, lng),
            };
            let center = match geo::encode_geohash(lat, lng, geo::LOCATION_PRECISION) {
                Ok(hash) => hash,
                Err(e) => {
                    warn!("[CROSSING] bad candidate coordinates: {}", e);
                    continue;
                }
            };

            self.process_pair(hub, user_id, other_id, &center).await;
        }

        Ok(())
    }

    /// Dedup, validate, persist, notify, invalidate — in that order. Every
    /// failure is soft: one bad pair never aborts the rest of the ping.
    async fn process_pair(&self, hub: &Hub, user_id: &str, other_id: &str, center: &str) {
        let (u1, u2) = canonical_pair(user_id, other_id);
        let dedup_key = cache::crossing_dedup_key(u1, u2);

        match self.kv.exists(&dedup_key).await {
            Ok(true) => return, // crossed within the window already
            Ok(false) => {}
            Err(e) => {
                // Proceed; record_crossing's window check backstops the miss.
                warn!("[CROSSING] dedup lookup failed: {}", e);
            }
        }

        match self.validate_pair_privacy(u1, u2).await {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                warn!("[CROSSING] privacy validation failed for {}:{}: {}", u1, u2, e);
                return;
            }
        }

        let crossing_id =
            match record_crossing(&self.db, u1, u2, center, Utc::now().timestamp()).await {
                Ok(Some(id)) => id,
                Ok(None) => return, // concurrent ping from the other side won
                Err(e) => {
                    error!("[CROSSING] failed to persist crossing: {}", e);
                    return;
                }
            };

        info!("[CROSSING] recorded crossing {} for {}:{}", crossing_id, u1, u2);

        notifications::notify_crossing(&self.db, hub, user_id, other_id, &crossing_id).await;
        notifications::notify_crossing(&self.db, hub, other_id, user_id, &crossing_id).await;

        for id in [u1, u2] {
            if let Err(e) = self.kv.del(&cache::crossings_key(id)).await {
                warn!("[CROSSING] cache invalidation failed for {}: {}", id, e);
            }
        }

        if let Err(e) = self
            .kv
            .set_nx_ex(&dedup_key, cache::CROSSING_DEDUP_TTL)
            .await
        {
            warn!("[CROSSING] failed to set dedup key {}: {}", dedup_key, e);
        }
    }

    /// A pair is rejected when either direction holds a block, or either
    /// user is in ghost mode or shadow-banned.
    async fn validate_pair_privacy(&self, u1: &str, u2: &str) -> Result<bool, sqlx::Error> {
        let blocked = sqlx::query(
            "SELECT 1 FROM blocks WHERE (blocker_id = ? AND blocked_id = ?) OR (blocker_id = ? AND blocked_id = ?)",
        )
        .bind(u1)
        .bind(u2)
        .bind(u2)
        .bind(u1)
        .fetch_optional(&self.db.pool)
        .await?;
        if blocked.is_some() {
            return Ok(false);
        }

        for id in [u1, u2] {
            let row = sqlx::query("SELECT is_ghost_mode, is_shadow_banned FROM users WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.db.pool)
                .await?;
            match row {
                Some(row) => {
                    let ghost: i64 = row.get("is_ghost_mode");
                    let banned: i64 = row.get("is_shadow_banned");
                    if ghost != 0 || banned != 0 {
                        return Ok(false);
                    }
                }
                None => return Ok(false),
            }
        }

        Ok(true)
    }
}

/// One entry of the aggregated crossings view: the other user, how often the
/// pair crossed, and when they last did.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrossingSummary {
    pub id: String,
    pub user_id: String,
    pub username: String,
    pub full_name: String,
    pub avatar_url: Option<String>,
    pub last_crossing_at: i64,
    pub crossing_count: i64,
}

/// Aggregated crossings for a user, newest first, behind a 5-minute
/// read-through cache.
pub async fn get_crossings(
    db: &Database,
    kv: &RedisCache,
    user_id: &str,
) -> Result<Vec<CrossingSummary>, ServiceError> {
    let cache_key = cache::crossings_key(user_id);
    if let Ok(Some(cached)) = kv.get(&cache_key).await {
        if let Ok(summaries) = serde_json::from_str::<Vec<CrossingSummary>>(&cached) {
            return Ok(summaries);
        }
    }

    let rows = sqlx::query(
        "SELECT id, user_id1, user_id2, occurred_at FROM crossings WHERE user_id1 = ? OR user_id2 = ? ORDER BY occurred_at DESC",
    )
    .bind(user_id)
    .bind(user_id)
    .fetch_all(&db.pool)
    .await?;

    let mut grouped: HashMap<String, CrossingSummary> = HashMap::new();
    for row in rows {
        let crossing_id: String = row.get("id");
        let u1: String = row.get("user_id1");
        let u2: String = row.get("user_id2");
        let occurred_at: i64 = row.get("occurred_at");
        let other_id = if u1 == user_id { u2 } else { u1 };

        if let Some(existing) = grouped.get_mut(&other_id) {
            existing.crossing_count += 1;
            if occurred_at > existing.last_crossing_at {
                existing.last_crossing_at = occurred_at;
            }
            continue;
        }

        let user_row = sqlx::query("SELECT username, full_name, avatar_url FROM users WHERE id = ?")
            .bind(&other_id)
            .fetch_optional(&db.pool)
            .await?;
        let Some(user_row) = user_row else {
            continue; // deleted account
        };

        grouped.insert(
            other_id.clone(),
            CrossingSummary {
                id: crossing_id,
                user_id: other_id,
                username: user_row.get("username"),
                full_name: user_row.get("full_name"),
                avatar_url: user_row.get("avatar_url"),
                last_crossing_at: occurred_at,
                crossing_count: 1,
            },
        );
    }

    let mut summaries: Vec<CrossingSummary> = grouped.into_values().collect();
    summaries.sort_by(|a, b| b.last_crossing_at.cmp(&a.last_crossing_at));

    if let Ok(json) = serde_json::to_string(&summaries) {
        if let Err(e) = kv.set_ex(&cache_key, &json, cache::CROSSINGS_TTL).await {
            warn!("[CROSSING] failed to cache crossings for {}: {}", user_id, e);
        }
    }

    Ok(summaries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_pair_is_order_insensitive() {
        assert_eq!(canonical_pair("b", "a"), ("a", "b"));
        assert_eq!(canonical_pair("a", "b"), ("a", "b"));
        assert_eq!(canonical_pair("a", "a"), ("a", "a"));
    }

    #[test]
    fn canonical_pair_uses_string_order_for_uuids() {
        // String sort, not numeric: "0f" < "a0" even though mixed-case or
        // numeric interpretations might disagree.
        let a = "0f000000-0000-0000-0000-000000000000";
        let b = "a0000000-0000-0000-0000-000000000000";
        assert_eq!(canonical_pair(b, a), (a, b));
    }
}
