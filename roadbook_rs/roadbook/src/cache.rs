use std::collections::HashMap;

use crate::RoadbookError;

/// Largest rounding precision accepted for cache keys. Beyond this the scaled
/// coordinate no longer fits comfortably in an `i64`.
pub const MAX_PRECISION: u32 = 9;

/// Coordinate rounded to a fixed number of decimal degrees.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CoordKey {
    lat: i64,
    lon: i64,
}

/// Append-only lookup cache keyed by rounded coordinate.
///
/// There is no eviction: one run processes one bounded track.
#[derive(Clone, Debug)]
pub struct CoordCache<V> {
    precision: u32,
    scale: f64,
    entries: HashMap<CoordKey, V>,
    hits: usize,
}

impl<V> CoordCache<V> {
    pub fn new(precision: u32) -> Result<Self, RoadbookError> {
        if precision > MAX_PRECISION {
            return Err(RoadbookError::InvalidParameter(format!(
                "cache precision {precision} exceeds {MAX_PRECISION} decimals"
            )));
        }
        Ok(Self {
            precision,
            scale: 10f64.powi(precision as i32),
            entries: HashMap::new(),
            hits: 0,
        })
    }

    pub fn precision(&self) -> u32 {
        self.precision
    }

    pub fn key(&self, lat: f64, lon: f64) -> CoordKey {
        CoordKey {
            lat: (lat * self.scale).round() as i64,
            lon: (lon * self.scale).round() as i64,
        }
    }

    pub fn get(&mut self, key: CoordKey) -> Option<&V> {
        let found = self.entries.get(&key);
        if found.is_some() {
            self.hits += 1;
        }
        found
    }

    pub fn insert(&mut self, key: CoordKey, value: V) {
        self.entries.insert(key, value);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of successful `get` calls so far.
    pub fn hits(&self) -> usize {
        self.hits
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nearby_coordinates_share_a_key() {
        let cache: CoordCache<()> = CoordCache::new(5).unwrap();
        assert_eq!(
            cache.key(45.123_451, 9.876_541),
            cache.key(45.123_449, 9.876_539)
        );
        assert_ne!(cache.key(45.12345, 9.87654), cache.key(45.12346, 9.87654));
    }

    #[test]
    fn coarser_precision_merges_more() {
        let cache: CoordCache<()> = CoordCache::new(4).unwrap();
        assert_eq!(cache.precision(), 4);
        assert_eq!(cache.key(45.12341, 9.0), cache.key(45.12344, 9.0));
    }

    #[test]
    fn counts_hits() {
        let mut cache = CoordCache::new(5).unwrap();
        let key = cache.key(1.0, 2.0);
        assert!(cache.get(key).is_none());
        cache.insert(key, "x");
        assert_eq!(cache.get(key), Some(&"x"));
        assert_eq!(cache.hits(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn rejects_absurd_precision() {
        assert!(CoordCache::<()>::new(12).is_err());
    }
}
