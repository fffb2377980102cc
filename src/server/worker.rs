use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{error, info, warn};
use sqlx::Row;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant};

use crate::server::cache::{self, RedisCache};
use crate::server::crossing::record_crossing;
use crate::server::database::Database;
use crate::server::hub::Hub;
use crate::server::notifications;

const CLEANUP_INTERVAL: Duration = Duration::from_secs(10 * 60);
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(60);
const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);
const SWEEP_TIMEOUT: Duration = Duration::from_secs(2 * 60);

/// The fallback sweeper only looks at pings this recent.
pub const SWEEP_LOOKBACK_SECONDS: i64 = 15 * 60;
/// Per-user cap on crossings created per day, enforced on the sweeper path
/// only; the live path relies on the dedup window.
pub const DAILY_CROSSING_CAP: i64 = 50;
/// Messages and notifications older than this are purged.
pub const RETENTION_SECONDS: i64 = 30 * 24 * 3600;

/// Periodic TTL sweeps over locations, stories, messages and notifications.
/// Exits at the next tick after shutdown flips.
pub fn spawn_cleanup(db: Arc<Database>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + CLEANUP_INTERVAL, CLEANUP_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    info!("[WORKER] running cleanup");
                    if timeout(CLEANUP_TIMEOUT, cleanup(&db)).await.is_err() {
                        warn!("[WORKER] cleanup sweep timed out");
                    }
                }
                _ = shutdown.changed() => {
                    info!("[WORKER] cleanup worker stopping");
                    break;
                }
            }
        }
    })
}

async fn cleanup(db: &Database) {
    let now = Utc::now().timestamp();
    let cutoff = now - RETENTION_SECONDS;

    let sweeps = [
        ("expired locations", "DELETE FROM locations WHERE expires_at < ?", now),
        ("expired stories", "DELETE FROM stories WHERE expires_at < ?", now),
        (
            "expired messages",
            "DELETE FROM messages WHERE expires_at IS NOT NULL AND expires_at < ?",
            now,
        ),
        ("old messages", "DELETE FROM messages WHERE created_at < ?", cutoff),
        (
            "old notifications",
            "DELETE FROM notifications WHERE created_at < ?",
            cutoff,
        ),
    ];

    for (what, query, bound) in sweeps {
        match sqlx::query(query).bind(bound).execute(&db.pool).await {
            Ok(result) => {
                if result.rows_affected() > 0 {
                    info!("[WORKER] deleted {} {}", result.rows_affected(), what);
                }
            }
            Err(e) => error!("[WORKER] failed to delete {}: {}", what, e),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CopresentPair {
    pub user_id1: String,
    pub user_id2: String,
    pub geohash: String,
    pub time_bucket: i64,
}

/// Pairs of users whose pings landed in the same geohash cell and the same
/// 10-minute bucket since `min_time`. Ghosted, shadow-banned and mutually
/// blocked users never appear. Pair order is already canonical (u1 < u2).
pub async fn find_copresent_pairs(
    db: &Database,
    min_time: i64,
) -> Result<Vec<CopresentPair>, sqlx::Error> {
    let rows = sqlx::query(
        r#"
        SELECT DISTINCT l1.user_id AS user_id1, l2.user_id AS user_id2,
                        l1.geohash AS geohash, l1.time_bucket AS time_bucket
        FROM locations l1
        JOIN locations l2
          ON l2.geohash = l1.geohash
         AND l2.time_bucket = l1.time_bucket
         AND l1.user_id < l2.user_id
        JOIN users u1 ON u1.id = l1.user_id
        JOIN users u2 ON u2.id = l2.user_id
        WHERE l1.time_bucket >= ?
          AND u1.is_ghost_mode = 0 AND u1.is_shadow_banned = 0
          AND u2.is_ghost_mode = 0 AND u2.is_shadow_banned = 0
          AND NOT EXISTS (
            SELECT 1 FROM blocks b
            WHERE (b.blocker_id = l1.user_id AND b.blocked_id = l2.user_id)
               OR (b.blocker_id = l2.user_id AND b.blocked_id = l1.user_id)
          )
    "#,
    )
    .bind(min_time)
    .fetch_all(&db.pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| CopresentPair {
            user_id1: row.get("user_id1"),
            user_id2: row.get("user_id2"),
            geohash: row.get("geohash"),
            time_bucket: row.get("time_bucket"),
        })
        .collect())
}

async fn crossings_today(db: &Database, user_id: &str) -> Result<i64, sqlx::Error> {
    let now = Utc::now().timestamp();
    let start_of_day = now - now.rem_euclid(24 * 3600);
    let row = sqlx::query(
        "SELECT COUNT(*) AS total FROM crossings WHERE (user_id1 = ? OR user_id2 = ?) AND occurred_at >= ?",
    )
    .bind(user_id)
    .bind(user_id)
    .bind(start_of_day)
    .fetch_one(&db.pool)
    .await?;
    Ok(row.get("total"))
}

/// Bucket-based crossing detection, the recovery path when the live geo
/// index misses or loses pings. Every 5 minutes it scans recent co-present
/// pairs and runs the same persist + notify + dedup flow as the live path.
pub fn spawn_crossing_sweeper(
    db: Arc<Database>,
    kv: Arc<RedisCache>,
    hub: Arc<Hub>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + SWEEP_INTERVAL, SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    info!("[WORKER] running crossing sweep");
                    match timeout(SWEEP_TIMEOUT, sweep_crossings(&db, &kv, &hub)).await {
                        Ok(Ok(processed)) => {
                            info!("[WORKER] processed {} co-present pairs", processed)
                        }
                        Ok(Err(e)) => error!("[WORKER] crossing sweep failed: {}", e),
                        Err(_) => warn!("[WORKER] crossing sweep timed out"),
                    }
                }
                _ = shutdown.changed() => {
                    info!("[WORKER] crossing sweeper stopping");
                    break;
                }
            }
        }
    })
}

async fn sweep_crossings(
    db: &Database,
    kv: &RedisCache,
    hub: &Hub,
) -> Result<usize, sqlx::Error> {
    let min_time = Utc::now().timestamp() - SWEEP_LOOKBACK_SECONDS;
    let pairs = find_copresent_pairs(db, min_time).await?;
    let total = pairs.len();

    for pair in pairs {
        let u1 = pair.user_id1.as_str();
        let u2 = pair.user_id2.as_str();

        if crossings_today(db, u1).await? >= DAILY_CROSSING_CAP
            || crossings_today(db, u2).await? >= DAILY_CROSSING_CAP
        {
            continue;
        }

        let dedup_key = cache::crossing_dedup_key(u1, u2);
        match kv.exists(&dedup_key).await {
            Ok(true) => continue,
            Ok(false) => {}
            // KV down: the window check on insert still keeps this idempotent
            Err(e) => warn!("[WORKER] dedup lookup failed: {}", e),
        }

        let crossing_id =
            match record_crossing(db, u1, u2, &pair.geohash, pair.time_bucket).await {
                Ok(Some(id)) => id,
                Ok(None) => continue, // live path got there first
                Err(e) => {
                    error!("[WORKER] failed to persist crossing {}:{}: {}", u1, u2, e);
                    continue;
                }
            };

        notifications::notify_crossing(db, hub, u1, u2, &crossing_id).await;
        notifications::notify_crossing(db, hub, u2, u1, &crossing_id).await;

        for id in [u1, u2] {
            if let Err(e) = kv.del(&cache::crossings_key(id)).await {
                warn!("[WORKER] cache invalidation failed for {}: {}", id, e);
            }
        }
        if let Err(e) = kv.set_nx_ex(&dedup_key, cache::CROSSING_DEDUP_TTL).await {
            warn!("[WORKER] failed to set dedup key {}: {}", dedup_key, e);
        }
    }

    Ok(total)
}
