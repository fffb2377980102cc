use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use crosspath::server::cache::RedisCache;
use crosspath::server::crossing::{self, record_crossing, CrossingDetector};
use crosspath::server::database::Database;
use crosspath::server::error::ServiceError;
use crosspath::server::geo;
use crosspath::server::hub::Hub;
use crosspath::server::location::{self, IngestOutcome};
use crosspath::server::safety::{LastLocation, LastLocationStore, SafetyMonitor};
use crosspath::server::worker;
use sqlx::Row;
use tokio::sync::Mutex;

const ALICE: &str = "11111111-1111-1111-1111-111111111111";
const BOB: &str = "22222222-2222-2222-2222-222222222222";
const CARA: &str = "33333333-3333-3333-3333-333333333333";

async fn setup() -> (Arc<Database>, Arc<RedisCache>) {
    let db = Database::connect("sqlite::memory:").await.unwrap();
    db.migrate().await.unwrap();
    let kv = RedisCache::new("redis://127.0.0.1:1/").unwrap();
    (Arc::new(db), Arc::new(kv))
}

async fn create_user(db: &Database, id: &str, username: &str) {
    sqlx::query("INSERT INTO users (id, username, created_at) VALUES (?, ?, ?)")
        .bind(id)
        .bind(username)
        .bind(0i64)
        .execute(&db.pool)
        .await
        .unwrap();
}

async fn insert_ping(db: &Database, user_id: &str, geohash: &str, bucket: i64) {
    sqlx::query(
        "INSERT INTO locations (user_id, geohash, lat, lng, time_bucket, created_at, expires_at) VALUES (?, ?, 0, 0, ?, ?, ?)",
    )
    .bind(user_id)
    .bind(geohash)
    .bind(bucket)
    .bind(bucket)
    .bind(bucket + geo::LOCATION_TTL_SECONDS)
    .execute(&db.pool)
    .await
    .unwrap();
}

#[tokio::test]
async fn accepted_ping_persists_coarsened_row() {
    let (db, kv) = setup().await;
    create_user(&db, ALICE, "alice").await;

    let safety = SafetyMonitor::new(kv.clone());
    let detector = CrossingDetector::new(db.clone(), kv.clone());
    let hub = Hub::new();

    // The KV store is down: the safety monitor fails open and the detector
    // hand-off fails soft; the ping itself must still be accepted.
    let outcome = location::update_location(&db, &safety, &detector, &hub, ALICE, 48.8566, 2.3522)
        .await
        .unwrap();
    assert_eq!(outcome, IngestOutcome::Accepted);

    let row = sqlx::query("SELECT geohash, time_bucket, created_at, expires_at FROM locations WHERE user_id = ?")
        .bind(ALICE)
        .fetch_one(&db.pool)
        .await
        .unwrap();

    let hash: String = row.get("geohash");
    let bucket: i64 = row.get("time_bucket");
    let created_at: i64 = row.get("created_at");
    let expires_at: i64 = row.get("expires_at");

    assert_eq!(hash.len(), 7);
    assert_eq!(bucket, geo::time_bucket(created_at));
    assert_eq!(expires_at - created_at, 24 * 3600);

    // Activity timestamp moved as well
    let last_active: Option<i64> = sqlx::query("SELECT last_active_at FROM users WHERE id = ?")
        .bind(ALICE)
        .fetch_one(&db.pool)
        .await
        .unwrap()
        .get("last_active_at");
    assert_eq!(last_active, Some(created_at));
}

/// In-memory last-location store so the speed gate can see a prior sample
/// without a live KV. `rewind` backdates a sample to fake elapsed time.
#[derive(Clone, Default)]
struct MemoryStore {
    samples: Arc<Mutex<HashMap<String, LastLocation>>>,
}

impl MemoryStore {
    async fn rewind(&self, user_id: &str, seconds: i64) {
        if let Some(sample) = self.samples.lock().await.get_mut(user_id) {
            sample.time -= seconds;
        }
    }
}

impl LastLocationStore for MemoryStore {
    async fn load(&self, user_id: &str) -> anyhow::Result<Option<LastLocation>> {
        Ok(self.samples.lock().await.get(user_id).cloned())
    }

    async fn save(&self, user_id: &str, sample: LastLocation) -> anyhow::Result<()> {
        self.samples.lock().await.insert(user_id.to_string(), sample);
        Ok(())
    }
}

#[tokio::test]
async fn fake_gps_ping_is_dropped_silently_and_bans() {
    let (db, kv) = setup().await;
    create_user(&db, ALICE, "alice").await;

    let store = MemoryStore::default();
    let safety = SafetyMonitor::with_store(store.clone());
    let detector = CrossingDetector::new(db.clone(), kv.clone());
    let hub = Hub::new();

    let first = location::update_location(&db, &safety, &detector, &hub, ALICE, 0.0, 0.0)
        .await
        .unwrap();
    assert_eq!(first, IngestOutcome::Accepted);

    // Pretend the first ping happened a minute ago; (0,0) -> (0,20) is
    // ~2220 km, so the second ping implies ~133,000 km/h
    store.rewind(ALICE, 60).await;

    let second = location::update_location(&db, &safety, &detector, &hub, ALICE, 0.0, 20.0)
        .await
        .unwrap();
    assert_eq!(second, IngestOutcome::SilentlyDropped);

    // The spoofed sample was never persisted
    let rows: i64 = sqlx::query("SELECT COUNT(*) AS c FROM locations WHERE user_id = ?")
        .bind(ALICE)
        .fetch_one(&db.pool)
        .await
        .unwrap()
        .get("c");
    assert_eq!(rows, 1);

    // And the user is now invisible to the detector
    let banned: i64 = sqlx::query("SELECT is_shadow_banned FROM users WHERE id = ?")
        .bind(ALICE)
        .fetch_one(&db.pool)
        .await
        .unwrap()
        .get("is_shadow_banned");
    assert_eq!(banned, 1);
}

#[tokio::test]
async fn out_of_range_coordinates_are_rejected() {
    let (db, kv) = setup().await;
    create_user(&db, ALICE, "alice").await;
    let safety = SafetyMonitor::new(kv.clone());
    let detector = CrossingDetector::new(db.clone(), kv.clone());
    let hub = Hub::new();

    for (lat, lng) in [(91.0, 0.0), (-90.5, 0.0), (0.0, 181.0), (0.0, -180.1)] {
        let result =
            location::update_location(&db, &safety, &detector, &hub, ALICE, lat, lng).await;
        assert!(matches!(result, Err(ServiceError::Validation(_))));
    }

    let count: i64 = sqlx::query("SELECT COUNT(*) AS c FROM locations")
        .fetch_one(&db.pool)
        .await
        .unwrap()
        .get("c");
    assert_eq!(count, 0);
}

#[tokio::test]
async fn one_crossing_row_per_pair_per_window() {
    let (db, _) = setup().await;
    create_user(&db, ALICE, "alice").await;
    create_user(&db, BOB, "bob").await;
    create_user(&db, CARA, "cara").await;

    let noon = 1_704_110_400; // 2024-01-01T12:00:00Z
    let first = record_crossing(&db, ALICE, BOB, "u09tvw0", noon).await.unwrap();
    assert!(first.is_some());

    // Ten minutes later, same pair: inside the window, swallowed
    let second = record_crossing(&db, ALICE, BOB, "u09tvw0", noon + 600)
        .await
        .unwrap();
    assert!(second.is_none());

    // The window slides; it does not reset at midnight. These two are only
    // sixty seconds apart across the date boundary.
    let before_midnight = 1_704_153_570; // 2024-01-01T23:59:30Z
    let first = record_crossing(&db, ALICE, CARA, "u09tvw0", before_midnight)
        .await
        .unwrap();
    assert!(first.is_some());
    let past_midnight = record_crossing(&db, ALICE, CARA, "u09tvw0", before_midnight + 60)
        .await
        .unwrap();
    assert!(past_midnight.is_none());

    // A full day on, the first pair may cross again
    let next_day = record_crossing(&db, ALICE, BOB, "u09tvw0", noon + 24 * 3600 + 1)
        .await
        .unwrap();
    assert!(next_day.is_some());

    let count: i64 = sqlx::query("SELECT COUNT(*) AS c FROM crossings")
        .fetch_one(&db.pool)
        .await
        .unwrap()
        .get("c");
    assert_eq!(count, 3);
}

#[tokio::test]
async fn crossings_view_aggregates_per_partner() {
    let (db, kv) = setup().await;
    create_user(&db, ALICE, "alice").await;
    create_user(&db, BOB, "bob").await;
    create_user(&db, CARA, "cara").await;

    let day = 24 * 3600;
    let base = Utc::now().timestamp() - 10 * day;
    // Alice crossed Bob on three different days, Cara once, later
    for i in 0..3 {
        record_crossing(&db, ALICE, BOB, "u09tvw0", base + i * day)
            .await
            .unwrap()
            .unwrap();
    }
    record_crossing(&db, ALICE, CARA, "u09tvw0", base + 5 * day)
        .await
        .unwrap()
        .unwrap();

    let summaries = crossing::get_crossings(&db, &kv, ALICE).await.unwrap();
    assert_eq!(summaries.len(), 2);

    // Most recent partner first
    assert_eq!(summaries[0].username, "cara");
    assert_eq!(summaries[0].crossing_count, 1);
    assert_eq!(summaries[1].username, "bob");
    assert_eq!(summaries[1].crossing_count, 3);
    assert_eq!(summaries[1].last_crossing_at, base + 2 * day);
}

#[tokio::test]
async fn sweeper_finds_pairs_sharing_cell_and_bucket() {
    let (db, _) = setup().await;
    create_user(&db, ALICE, "alice").await;
    create_user(&db, BOB, "bob").await;
    create_user(&db, CARA, "cara").await;

    let bucket = geo::time_bucket(Utc::now().timestamp());
    insert_ping(&db, ALICE, "u09tvw0", bucket).await;
    insert_ping(&db, BOB, "u09tvw0", bucket).await;
    // Cara is in a different cell
    insert_ping(&db, CARA, "u09tvw1", bucket).await;

    let pairs = worker::find_copresent_pairs(&db, bucket - 60).await.unwrap();
    assert_eq!(pairs.len(), 1);
    // Canonical order: ALICE sorts before BOB
    assert_eq!(pairs[0].user_id1, ALICE);
    assert_eq!(pairs[0].user_id2, BOB);
    assert_eq!(pairs[0].geohash, "u09tvw0");
    assert_eq!(pairs[0].time_bucket, bucket);
}

#[tokio::test]
async fn ghosts_bans_and_blocks_never_surface_in_the_sweep() {
    let (db, _) = setup().await;
    create_user(&db, ALICE, "alice").await;
    create_user(&db, BOB, "bob").await;
    create_user(&db, CARA, "cara").await;

    let bucket = geo::time_bucket(Utc::now().timestamp());
    for user in [ALICE, BOB, CARA] {
        insert_ping(&db, user, "u09tvw0", bucket).await;
    }

    // Cara went ghost; Alice blocked Bob
    sqlx::query("UPDATE users SET is_ghost_mode = 1 WHERE id = ?")
        .bind(CARA)
        .execute(&db.pool)
        .await
        .unwrap();
    sqlx::query("INSERT INTO blocks (blocker_id, blocked_id, created_at) VALUES (?, ?, 0)")
        .bind(ALICE)
        .bind(BOB)
        .execute(&db.pool)
        .await
        .unwrap();

    let pairs = worker::find_copresent_pairs(&db, bucket - 60).await.unwrap();
    assert!(pairs.is_empty());

    // Shadow ban hides the remaining pair too
    sqlx::query("UPDATE users SET is_ghost_mode = 0 WHERE id = ?")
        .bind(CARA)
        .execute(&db.pool)
        .await
        .unwrap();
    sqlx::query("UPDATE users SET is_shadow_banned = 1 WHERE id = ?")
        .bind(ALICE)
        .execute(&db.pool)
        .await
        .unwrap();
    let pairs = worker::find_copresent_pairs(&db, bucket - 60).await.unwrap();
    assert_eq!(pairs.len(), 1);
    assert_eq!(pairs[0].user_id1, BOB);
    assert_eq!(pairs[0].user_id2, CARA);
}

#[tokio::test]
async fn old_buckets_are_outside_the_sweep_window() {
    let (db, _) = setup().await;
    create_user(&db, ALICE, "alice").await;
    create_user(&db, BOB, "bob").await;

    let stale = geo::time_bucket(Utc::now().timestamp() - 3600);
    insert_ping(&db, ALICE, "u09tvw0", stale).await;
    insert_ping(&db, BOB, "u09tvw0", stale).await;

    let min_time = Utc::now().timestamp() - worker::SWEEP_LOOKBACK_SECONDS;
    let pairs = worker::find_copresent_pairs(&db, min_time).await.unwrap();
    assert!(pairs.is_empty());
}
