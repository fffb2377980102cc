use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use log::warn;

use crate::server::cache::{self, RedisCache};

/// Anything faster than a jet is definitely a spoofed GPS.
pub const MAX_SPEED_KMH: f64 = 1000.0;

const EARTH_RADIUS_KM: f64 = 6371.0;

#[derive(Debug, Clone)]
pub struct Validation {
    pub allowed: bool,
    pub reason: Option<String>,
    pub should_ban: bool,
}

impl Validation {
    fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
            should_ban: false,
        }
    }
}

/// The last accepted sample for a user.
#[derive(Debug, Clone)]
pub struct LastLocation {
    pub lat: f64,
    pub lng: f64,
    pub time: i64,
}

/// Storage for per-user last-location samples. Production keeps them in the
/// KV store under `safety:last_loc:{user}` with a 24 h TTL; tests swap in a
/// map.
pub trait LastLocationStore: Send + Sync {
    fn load(
        &self,
        user_id: &str,
    ) -> impl Future<Output = anyhow::Result<Option<LastLocation>>> + Send;
    fn save(
        &self,
        user_id: &str,
        sample: LastLocation,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;
}

/// KV-backed store: a hash of `{lat, lng, time}` per user.
pub struct RedisLastLocationStore {
    kv: Arc<RedisCache>,
}

impl LastLocationStore for RedisLastLocationStore {
    async fn load(&self, user_id: &str) -> anyhow::Result<Option<LastLocation>> {
        let map = self.kv.hgetall(&cache::last_location_key(user_id)).await?;
        if map.is_empty() {
            return Ok(None);
        }
        Ok(Some(LastLocation {
            lat: parse_f64(map.get("lat")),
            lng: parse_f64(map.get("lng")),
            time: map
                .get("time")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
        }))
    }

    async fn save(&self, user_id: &str, sample: LastLocation) -> anyhow::Result<()> {
        let fields = [
            ("lat", sample.lat.to_string()),
            ("lng", sample.lng.to_string()),
            ("time", sample.time.to_string()),
        ];
        self.kv
            .hset_with_ttl(
                &cache::last_location_key(user_id),
                &fields,
                cache::LAST_LOCATION_TTL,
            )
            .await
    }
}

/// Great-circle distance between two coordinates, in kilometers.
pub fn haversine_km(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lng = (lng2 - lng1).to_radians();
    let lat1 = lat1.to_radians();
    let lat2 = lat2.to_radians();

    let a = (d_lat / 2.0).sin().powi(2) + (d_lng / 2.0).sin().powi(2) * lat1.cos() * lat2.cos();
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_KM * c
}

/// Implied speed between two samples, in km/h.
pub fn speed_kmh(distance_km: f64, elapsed_seconds: i64) -> f64 {
    distance_km / (elapsed_seconds as f64 / 3600.0)
}

/// Fake-GPS gate. Keeps each user's last accepted sample and rejects
/// movement that implies impossible speed.
pub struct SafetyMonitor<S> {
    store: S,
}

impl SafetyMonitor<RedisLastLocationStore> {
    pub fn new(kv: Arc<RedisCache>) -> Self {
        Self::with_store(RedisLastLocationStore { kv })
    }
}

impl<S: LastLocationStore> SafetyMonitor<S> {
    pub fn with_store(store: S) -> Self {
        Self { store }
    }

    /// Check a new sample against the previous one. Fails open: if the store
    /// cannot be read or written, the ping is allowed — infrastructure
    /// faults must never reject a legitimate request.
    pub async fn validate(&self, user_id: &str, lat: f64, lng: f64) -> Validation {
        let previous = match self.store.load(user_id).await {
            Ok(previous) => previous,
            Err(e) => {
                warn!("[SAFETY] last-location read failed, allowing: {}", e);
                return Validation::allow();
            }
        };

        let now = Utc::now().timestamp();
        let Some(previous) = previous else {
            // First ping or expired sample
            self.save_last_location(user_id, lat, lng, now).await;
            return Validation::allow();
        };

        let elapsed = now - previous.time;
        if elapsed <= 0 {
            // Same second or clock skew; accept and overwrite
            self.save_last_location(user_id, lat, lng, now).await;
            return Validation::allow();
        }

        let distance_km = haversine_km(previous.lat, previous.lng, lat, lng);
        let speed = speed_kmh(distance_km, elapsed);

        if speed > MAX_SPEED_KMH {
            return Validation {
                allowed: false,
                reason: Some(format!("speed limit exceeded ({:.2} km/h)", speed)),
                should_ban: true,
            };
        }

        self.save_last_location(user_id, lat, lng, now).await;
        Validation::allow()
    }

    async fn save_last_location(&self, user_id: &str, lat: f64, lng: f64, time: i64) {
        let sample = LastLocation { lat, lng, time };
        if let Err(e) = self.store.save(user_id, sample).await {
            warn!("[SAFETY] last-location write failed: {}", e);
        }
    }
}

fn parse_f64(value: Option<&String>) -> f64 {
    value.and_then(|v| v.parse().ok()).unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct MemoryStore {
        samples: Mutex<HashMap<String, LastLocation>>,
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

    #[test]
    fn haversine_matches_known_distances() {
        // Paris -> London is roughly 344 km
        let d = haversine_km(48.8566, 2.3522, 51.5074, -0.1278);
        assert!((d - 344.0).abs() < 5.0, "got {}", d);

        // Zero distance
        assert!(haversine_km(10.0, 20.0, 10.0, 20.0) < 1e-9);
    }

    #[test]
    fn teleport_across_twenty_degrees_reads_as_fake() {
        // (0,0) -> (0,20) is ~2224 km; in 60 seconds that is ~133,000 km/h
        let d = haversine_km(0.0, 0.0, 0.0, 20.0);
        let speed = speed_kmh(d, 60);
        assert!(speed > MAX_SPEED_KMH);
        assert!(speed > 100_000.0, "got {}", speed);
    }

    #[test]
    fn walking_speed_is_fine() {
        // ~5 m in 3 seconds
        let d = haversine_km(48.8566, 2.3522, 48.85661, 2.35221);
        assert!(speed_kmh(d, 3) < MAX_SPEED_KMH);
    }

    #[tokio::test]
    async fn impossible_movement_flags_a_ban_and_keeps_the_old_sample() {
        let store = MemoryStore::default();
        store
            .save(
                "u1",
                LastLocation {
                    lat: 0.0,
                    lng: 0.0,
                    time: Utc::now().timestamp() - 60,
                },
            )
            .await
            .unwrap();
        let monitor = SafetyMonitor::with_store(store);

        let result = monitor.validate("u1", 0.0, 20.0).await;
        assert!(!result.allowed);
        assert!(result.should_ban);

        // The spoofed sample must not replace the last good one
        let kept = monitor.store.load("u1").await.unwrap().unwrap();
        assert_eq!(kept.lng, 0.0);
    }

    #[tokio::test]
    async fn plausible_movement_is_accepted_and_recorded() {
        let store = MemoryStore::default();
        store
            .save(
                "u1",
                LastLocation {
                    lat: 48.8566,
                    lng: 2.3522,
                    time: Utc::now().timestamp() - 3600,
                },
            )
            .await
            .unwrap();
        let monitor = SafetyMonitor::with_store(store);

        // ~344 km in an hour is a train, not a spoof
        let result = monitor.validate("u1", 51.5074, -0.1278).await;
        assert!(result.allowed);

        let kept = monitor.store.load("u1").await.unwrap().unwrap();
        assert!((kept.lat - 51.5074).abs() < 1e-9);
    }

    #[tokio::test]
    async fn monitor_fails_open_when_kv_is_down() {
        let kv = Arc::new(RedisCache::new("redis://127.0.0.1:1/").unwrap());
        let monitor = SafetyMonitor::new(kv);
        let result = monitor.validate("u1", 48.8566, 2.3522).await;
        assert!(result.allowed);
        assert!(!result.should_ban);
    }
}
