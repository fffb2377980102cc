use geohash::Coord;

/// Geohash length for stored pings, ~76 m per cell.
pub const LOCATION_PRECISION: usize = 7;
/// Geohash length for feed buckets, ~2.4 km per cell.
pub const FEED_PRECISION: usize = 5;
/// Pings are grouped into 10-minute buckets for the batched sweeper.
pub const BUCKET_SECONDS: i64 = 600;
/// Pings live for 24 hours before the cleanup worker removes them.
pub const LOCATION_TTL_SECONDS: i64 = 24 * 3600;

/// Encode a coordinate pair to a geohash of the given length.
pub fn encode_geohash(lat: f64, lng: f64, len: usize) -> anyhow::Result<String> {
    let hash = geohash::encode(Coord { x: lng, y: lat }, len)?;
    Ok(hash)
}

/// Floor a unix timestamp to its 10-minute bucket.
pub fn time_bucket(ts: i64) -> i64 {
    ts - ts.rem_euclid(BUCKET_SECONDS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geohash_has_requested_precision() {
        // Known cell for central Paris
        let hash = encode_geohash(48.8566, 2.3522, LOCATION_PRECISION).unwrap();
        assert_eq!(hash, "u09tvw0");

        let feed = encode_geohash(48.8566, 2.3522, FEED_PRECISION).unwrap();
        assert_eq!(feed, "u09tv");
    }

    #[test]
    fn nearby_points_share_a_cell() {
        // ~1.5 m apart: same geohash7 cell
        let a = encode_geohash(48.8566, 2.3522, LOCATION_PRECISION).unwrap();
        let b = encode_geohash(48.85661, 2.35221, LOCATION_PRECISION).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn time_bucket_floors_to_ten_minutes() {
        // 2024-01-01T00:07:31Z -> 00:00:00
        assert_eq!(time_bucket(1_704_067_651), 1_704_067_200);
        // Exact boundary maps to itself
        assert_eq!(time_bucket(1_704_067_200), 1_704_067_200);
        assert_eq!(time_bucket(0), 0);
    }
}
