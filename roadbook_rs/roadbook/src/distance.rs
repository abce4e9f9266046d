//! Cumulative along-track distance.

use geo::{point, GeodesicDistance};

use crate::TrackPoint;

/// WGS84 geodesic distance in metres between two coordinates.
pub fn geodesic_distance(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    // x is longitude, y is latitude.
    let p1 = point!(x: lon1, y: lat1);
    let p2 = point!(x: lon2, y: lat2);
    p1.geodesic_distance(&p2)
}

/// Cumulative distance in metres from the first point, parallel to `points`.
///
/// `distance[0]` is always 0 and the sequence never decreases. An empty track
/// still yields a single zero so callers can index the first sample blindly.
pub fn cumulative_distances(points: &[TrackPoint]) -> Vec<f64> {
    let mut out = Vec::with_capacity(points.len().max(1));
    out.push(0.0);
    let mut total = 0.0;
    for w in points.windows(2) {
        let step = geodesic_distance(w[0].lat, w[0].lon, w[1].lat, w[1].lon);
        if step.is_finite() && step > 0.0 {
            total += step;
        }
        out.push(total);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn pt(lat: f64, lon: f64) -> TrackPoint {
        TrackPoint {
            lat,
            lon,
            elevation: None,
        }
    }

    #[test]
    fn one_degree_along_equator() {
        let dist = geodesic_distance(0.0, 0.0, 0.0, 1.0);
        assert!((dist - 111_319.49).abs() < 1.0, "got {dist}");
    }

    #[test]
    fn repeated_point_adds_nothing() {
        let points = vec![pt(45.0, 9.0), pt(45.001, 9.0), pt(45.001, 9.0)];
        let dist = cumulative_distances(&points);
        assert_eq!(dist[1], dist[2]);
    }

    proptest! {
        #[test]
        fn cumulative_is_monotonic_and_starts_at_zero(
            ref coords in prop::collection::vec((-80.0f64..80.0, -179.0f64..179.0), 2..60)
        ) {
            let points: Vec<TrackPoint> = coords.iter().map(|&(lat, lon)| pt(lat, lon)).collect();
            let dist = cumulative_distances(&points);
            prop_assert_eq!(dist.len(), points.len());
            prop_assert_eq!(dist[0], 0.0);
            for w in dist.windows(2) {
                prop_assert!(w[0] <= w[1]);
            }
        }
    }

    #[test]
    fn short_tracks_yield_single_zero() {
        assert_eq!(cumulative_distances(&[]), vec![0.0]);
        assert_eq!(cumulative_distances(&[pt(1.0, 2.0)]), vec![0.0]);
    }

    #[test]
    fn deterministic_for_identical_input() {
        let points = vec![pt(44.1, 11.2), pt(44.2, 11.25), pt(44.3, 11.1)];
        assert_eq!(cumulative_distances(&points), cumulative_distances(&points));
    }
}
