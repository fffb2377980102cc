use std::collections::HashMap;
use std::sync::Arc;

use redis::aio::ConnectionManager;
use redis::geo::{Coord, RadiusOptions, RadiusSearchResult, Unit};
use redis::AsyncCommands;
use tokio::sync::Mutex;

// Cache TTLs, in seconds. Every key family has a TTL; nothing is cached
// forever and the database stays the source of truth.
pub const PROFILE_TTL: u64 = 10 * 60;
pub const FEED_TTL: u64 = 5 * 60;
pub const CONVERSATION_TTL: u64 = 10 * 60;
pub const UNREAD_COUNT_TTL: u64 = 30 * 60;
pub const CROSSINGS_TTL: u64 = 5 * 60;
pub const STORIES_TTL: u64 = 5 * 60;
pub const MAP_TTL: u64 = 5 * 60;
pub const ADMIN_STATS_TTL: u64 = 60;
pub const LAST_LOCATION_TTL: u64 = 24 * 3600;
pub const CROSSING_DEDUP_TTL: u64 = 24 * 3600;

/// Geo set holding the live position of recently-active users.
pub const USER_LOCATIONS_KEY: &str = "users:locations";

pub fn profile_key(user_id: &str) -> String {
    format!("profile:{}", user_id)
}

pub fn feed_key(geohash5: &str) -> String {
    format!("feed:{}", geohash5)
}

/// Conversation key with the two ids sorted, so both participants address
/// the same entry.
pub fn conversation_key(user_id1: &str, user_id2: &str) -> String {
    let mut ids = [user_id1, user_id2];
    ids.sort();
    format!("messages:{}:{}", ids[0], ids[1])
}

pub fn unread_count_key(user_id: &str) -> String {
    format!("unread_count:{}", user_id)
}

pub fn crossings_key(user_id: &str) -> String {
    format!("crossings:v3:{}", user_id)
}

pub fn connection_stories_key(user_id: &str) -> String {
    format!("stories:connections:{}", user_id)
}

pub fn map_key(north: f64, south: f64, east: f64, west: f64, user_id: &str) -> String {
    format!("map:{}:{}:{}:{}:{}", north, south, east, west, user_id)
}

pub fn admin_stats_key() -> String {
    "admin:stats".to_string()
}

pub fn last_location_key(user_id: &str) -> String {
    format!("safety:last_loc:{}", user_id)
}

/// Dedup key for a crossing pair. Callers pass the pair already in canonical
/// order (user_id1 < user_id2).
pub fn crossing_dedup_key(user_id1: &str, user_id2: &str) -> String {
    format!("crossing:{}:{}", user_id1, user_id2)
}

/// Async Redis handle shared by the cache layer, the safety monitor and the
/// crossing detector's geo index.
///
/// The connection manager is established on first use, not at construction:
/// a Redis that is down at boot (or dies later) degrades every operation to
/// an error the caller logs and moves past, it never takes the server down.
pub struct RedisCache {
    client: redis::Client,
    conn: Arc<Mutex<Option<ConnectionManager>>>,
}

impl RedisCache {
    pub fn new(redis_address: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(redis_address)?;
        Ok(Self {
            client,
            conn: Arc::new(Mutex::new(None)),
        })
    }

    async fn manager(&self) -> anyhow::Result<ConnectionManager> {
        let mut guard = self.conn.lock().await;
        if let Some(manager) = guard.as_ref() {
            return Ok(manager.clone());
        }
        let manager = ConnectionManager::new(self.client.clone()).await?;
        *guard = Some(manager.clone());
        Ok(manager)
    }

    pub async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let mut conn = self.manager().await?;
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    pub async fn get_i64(&self, key: &str) -> anyhow::Result<Option<i64>> {
        let mut conn = self.manager().await?;
        let value: Option<i64> = conn.get(key).await?;
        Ok(value)
    }

    pub async fn set_ex(&self, key: &str, value: &str, ttl_seconds: u64) -> anyhow::Result<()> {
        let mut conn = self.manager().await?;
        let _: () = conn.set_ex(key, value, ttl_seconds).await?;
        Ok(())
    }

    pub async fn del(&self, key: &str) -> anyhow::Result<()> {
        let mut conn = self.manager().await?;
        let _: () = conn.del(key).await?;
        Ok(())
    }

    pub async fn incr(&self, key: &str) -> anyhow::Result<i64> {
        let mut conn = self.manager().await?;
        let value: i64 = conn.incr(key, 1i64).await?;
        Ok(value)
    }

    pub async fn exists(&self, key: &str) -> anyhow::Result<bool> {
        let mut conn = self.manager().await?;
        let found: bool = conn.exists(key).await?;
        Ok(found)
    }

    /// SET NX EX. Returns true when this caller created the key.
    pub async fn set_nx_ex(&self, key: &str, ttl_seconds: u64) -> anyhow::Result<bool> {
        let mut conn = self.manager().await?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg("1")
            .arg("NX")
            .arg("EX")
            .arg(ttl_seconds)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    pub async fn hgetall(&self, key: &str) -> anyhow::Result<HashMap<String, String>> {
        let mut conn = self.manager().await?;
        let map: HashMap<String, String> = conn.hgetall(key).await?;
        Ok(map)
    }

    pub async fn hset_with_ttl(
        &self,
        key: &str,
        fields: &[(&str, String)],
        ttl_seconds: u64,
    ) -> anyhow::Result<()> {
        let mut conn = self.manager().await?;
        let _: () = conn.hset_multiple(key, fields).await?;
        let _: () = conn.expire(key, ttl_seconds as i64).await?;
        Ok(())
    }

    /// Upsert a member's position in a geo set.
    pub async fn geo_add(&self, key: &str, lat: f64, lng: f64, member: &str) -> anyhow::Result<()> {
        let mut conn = self.manager().await?;
        let _: () = conn.geo_add(key, (Coord::lon_lat(lng, lat), member)).await?;
        Ok(())
    }

    /// Radius query around a point, members returned with distance and
    /// coordinates.
    pub async fn geo_radius(
        &self,
        key: &str,
        lat: f64,
        lng: f64,
        radius_meters: f64,
    ) -> anyhow::Result<Vec<RadiusSearchResult>> {
        let mut conn = self.manager().await?;
        let options = RadiusOptions::default().with_coord().with_dist();
        let matches: Vec<RadiusSearchResult> = conn
            .geo_radius(key, lng, lat, radius_meters, Unit::Meters, options)
            .await?;
        Ok(matches)
    }

    /// SCAN-and-delete every key under a prefix. Replaces the inert
    /// `DEL feed:*` the admin path used to issue against a plain key store.
    pub async fn invalidate_prefix(&self, prefix: &str) -> anyhow::Result<u64> {
        let mut conn = self.manager().await?;
        let pattern = format!("{}*", prefix);
        let mut cursor: u64 = 0;
        let mut removed: u64 = 0;
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await?;
            if !keys.is_empty() {
                removed += keys.len() as u64;
                let _: () = conn.del(keys).await?;
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversation_key_sorts_participants() {
        let a = "2f5b0000-0000-0000-0000-000000000000";
        let b = "9c1d0000-0000-0000-0000-000000000000";
        assert_eq!(conversation_key(a, b), conversation_key(b, a));
        assert_eq!(conversation_key(a, b), format!("messages:{}:{}", a, b));
    }

    #[test]
    fn key_grammar() {
        assert_eq!(profile_key("u1"), "profile:u1");
        assert_eq!(feed_key("u09t2"), "feed:u09t2");
        assert_eq!(unread_count_key("u1"), "unread_count:u1");
        assert_eq!(crossings_key("u1"), "crossings:v3:u1");
        assert_eq!(connection_stories_key("u1"), "stories:connections:u1");
        assert_eq!(last_location_key("u1"), "safety:last_loc:u1");
        assert_eq!(crossing_dedup_key("a", "b"), "crossing:a:b");
        assert_eq!(map_key(1.0, 2.0, 3.0, 4.0, "u1"), "map:1:2:3:4:u1");
    }

    #[tokio::test]
    async fn cache_faults_are_errors_not_panics() {
        // Nothing listens on this port; every operation must surface an Err
        // the caller can treat as a soft failure.
        let cache = RedisCache::new("redis://127.0.0.1:1/").unwrap();
        assert!(cache.get("profile:u1").await.is_err());
        assert!(cache.set_ex("profile:u1", "{}", 60).await.is_err());
        assert!(cache.incr("unread_count:u1").await.is_err());
    }
}
