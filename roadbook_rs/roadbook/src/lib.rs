//! Route segmentation for GPS tracks.
//!
//! A track is classified point by point through a reverse geocoder, folded
//! into blocks of constant classification, merged, filtered and projected
//! onto travel speeds to produce a roadbook table.

use std::io::Cursor;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

pub mod cache;
pub mod classify;
pub mod distance;
pub mod geocode;
pub mod profile;
pub mod segment;
pub mod timing;

pub use classify::{Classification, PointClassifier};
pub use geocode::{
    AddressRecord, FixedDelay, LookupError, NominatimConfig, NominatimGeocoder, ReverseGeocoder,
    Throttle, ThrottledLookup, Unthrottled,
};
pub use profile::{annotate_profile, LocalityResolver, ProfileAnnotations};
pub use segment::{merge_blocks, Block, BlockBuilder};
pub use timing::{SegmentRow, TimingProjector};

use crate::cache::MAX_PRECISION;
use crate::distance::cumulative_distances;

#[derive(Error, Debug)]
pub enum RoadbookError {
    #[error("failed to parse GPX file: {0}")]
    GpxParse(String),
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
}

/// One track sample.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrackPoint {
    pub lat: f64,
    pub lon: f64,
    pub elevation: Option<f64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Params {
    /// Blocks shorter than this are treated as geocoding noise.
    pub min_block_m: f64,
    /// Leading blocks that are kept even when short.
    pub exempt_leading_blocks: usize,
    pub speeds_kmh: Vec<f64>,
    /// Start of day, `H:MM`.
    pub start_time: String,
    /// Decimal degrees kept in the classification cache key.
    pub segment_precision: u32,
    /// Decimal degrees kept in the profile locality cache key.
    pub profile_precision: u32,
    /// Resolve one point out of `profile_stride` for locality labels.
    pub profile_stride: usize,
    pub max_climb_markers: usize,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            min_block_m: 50.0,
            exempt_leading_blocks: 1,
            speeds_kmh: vec![32.0, 36.0, 40.0],
            start_time: "9:00".to_string(),
            segment_precision: 5,
            profile_precision: 4,
            profile_stride: 20,
            max_climb_markers: 3,
        }
    }
}

impl Params {
    pub fn validate(&self) -> Result<(), RoadbookError> {
        if !(self.min_block_m.is_finite() && self.min_block_m >= 0.0) {
            return Err(RoadbookError::InvalidParameter(format!(
                "minimum block length must be >= 0 m, got {}",
                self.min_block_m
            )));
        }
        timing::validate_speeds(&self.speeds_kmh)?;
        timing::parse_start_time(&self.start_time)?;
        for precision in [self.segment_precision, self.profile_precision] {
            if precision > MAX_PRECISION {
                return Err(RoadbookError::InvalidParameter(format!(
                    "cache precision {precision} exceeds {MAX_PRECISION} decimals"
                )));
            }
        }
        if self.profile_stride == 0 {
            return Err(RoadbookError::InvalidParameter(
                "profile stride must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Observer for "N of M processed" updates.
pub trait Progress {
    fn advance(&mut self, processed: usize, total: usize);
    fn finish(&mut self) {}
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoProgress;

impl Progress for NoProgress {
    fn advance(&mut self, _processed: usize, _total: usize) {}
}

/// Read every track segment of a GPX document, concatenated in file order.
pub fn parse_track(input: &[u8]) -> Result<Vec<TrackPoint>, RoadbookError> {
    let gpx = gpx::read(Cursor::new(input)).map_err(|e| RoadbookError::GpxParse(e.to_string()))?;
    let mut out = Vec::new();
    for track in gpx.tracks {
        for segment in track.segments {
            for point in segment.points {
                let geo = point.point();
                out.push(TrackPoint {
                    lat: geo.y(),
                    lon: geo.x(),
                    elevation: point.elevation,
                });
            }
        }
    }
    Ok(out)
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SegmentStats {
    pub points: usize,
    pub degraded_lookups: usize,
    pub raw_blocks: usize,
    pub discarded_blocks: usize,
    pub merged_blocks: usize,
    pub kept_blocks: usize,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Roadbook {
    /// Merged, contiguous blocks before the validity filter.
    pub blocks: Vec<Block>,
    pub rows: Vec<SegmentRow>,
    pub total_km: f64,
    pub stats: SegmentStats,
}

impl Roadbook {
    /// True when the track produced no block at all.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

/// Run the whole segmentation pipeline over one track.
///
/// Lookup failures never abort the run: the point falls back to the unknown
/// classification and the failure is logged.
pub fn build_roadbook<G: ReverseGeocoder, T: Throttle>(
    points: &[TrackPoint],
    classifier: &mut PointClassifier<G, T>,
    params: &Params,
    progress: &mut dyn Progress,
) -> Result<Roadbook, RoadbookError> {
    params.validate()?;
    let projector = TimingProjector::new(&params.start_time, &params.speeds_kmh)?;
    if points.is_empty() {
        return Ok(Roadbook::default());
    }

    let distances = cumulative_distances(points);
    let mut builder = BlockBuilder::new(params.min_block_m, params.exempt_leading_blocks);
    let mut degraded = 0usize;
    for (idx, (point, distance_m)) in points.iter().zip(&distances).enumerate() {
        let classification = match classifier.classify(point.lat, point.lon) {
            Ok(c) => c,
            Err(err) => {
                warn!(lat = point.lat, lon = point.lon, "{err}; using unknown classification");
                degraded += 1;
                Classification::unknown()
            }
        };
        builder.push(distance_m / 1000.0, classification);
        progress.advance(idx + 1, points.len());
    }
    progress.finish();

    let discarded_blocks = builder.discarded();
    let raw = builder.finish();
    let blocks = merge_blocks(&raw);
    let rows = projector.project(&blocks);

    let stats = SegmentStats {
        points: points.len(),
        degraded_lookups: degraded,
        raw_blocks: raw.len(),
        discarded_blocks,
        merged_blocks: blocks.len(),
        kept_blocks: rows.len(),
    };
    info!(
        "Segmented {} points: {} blocks ({} short discarded), {} merged, {} kept",
        stats.points, stats.raw_blocks, stats.discarded_blocks, stats.merged_blocks, stats.kept_blocks
    );

    Ok(Roadbook {
        total_km: distances.last().copied().unwrap_or(0.0) / 1000.0,
        blocks,
        rows,
        stats,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::UNKNOWN_ROAD;

    /// Resolves by latitude band so tests can lay out roads along a track.
    struct BandGeocoder {
        bands: Vec<(f64, Option<AddressRecord>)>,
        fail_below: Option<f64>,
    }

    impl ReverseGeocoder for BandGeocoder {
        fn reverse(&mut self, lat: f64, _lon: f64) -> Result<Option<AddressRecord>, LookupError> {
            if self.fail_below.is_some_and(|limit| lat < limit) {
                return Err(LookupError::Failure("connection refused".into()));
            }
            Ok(self
                .bands
                .iter()
                .find(|(upto, _)| lat < *upto)
                .and_then(|(_, rec)| rec.clone()))
        }
    }

    fn street(road: &str, town: &str) -> Option<AddressRecord> {
        Some(AddressRecord {
            road: Some(road.into()),
            town: Some(town.into()),
            ..AddressRecord::default()
        })
    }

    /// Northbound track, one point every ~11 m.
    fn northbound(n: usize) -> Vec<TrackPoint> {
        (0..n)
            .map(|i| TrackPoint {
                lat: 45.0 + i as f64 * 0.0001,
                lon: 7.0,
                elevation: Some(250.0),
            })
            .collect()
    }

    fn classifier(geo: BandGeocoder) -> PointClassifier<BandGeocoder, Unthrottled> {
        PointClassifier::new(ThrottledLookup::new(geo, Unthrottled, 3), 5).unwrap()
    }

    #[test]
    fn parses_all_segments_in_order() {
        let gpx = br#"<?xml version="1.0" encoding="UTF-8"?>
<gpx version="1.1" creator="roadbook-tests" xmlns="http://www.topografix.com/GPX/1/1">
  <trk>
    <name>loop</name>
    <trkseg>
      <trkpt lat="45.0" lon="7.0"><ele>240.5</ele></trkpt>
      <trkpt lat="45.001" lon="7.001"></trkpt>
    </trkseg>
    <trkseg>
      <trkpt lat="45.002" lon="7.002"><ele>250</ele></trkpt>
    </trkseg>
  </trk>
</gpx>"#;
        let points = parse_track(gpx).unwrap();
        assert_eq!(points.len(), 3);
        assert_eq!(points[0].lat, 45.0);
        assert_eq!(points[0].lon, 7.0);
        assert_eq!(points[0].elevation, Some(240.5));
        assert_eq!(points[1].elevation, None);
        assert_eq!(points[2].lat, 45.002);
    }

    #[test]
    fn unreadable_track_is_an_error() {
        assert!(matches!(
            parse_track(b"definitely not xml"),
            Err(RoadbookError::GpxParse(_))
        ));
    }

    #[test]
    fn builds_rows_for_a_simple_route() {
        let geo = BandGeocoder {
            bands: vec![
                (45.00505, street("Via Roma", "Alba")),
                // Two samples (~11 m) of noise in the middle of Via Roma.
                (45.00525, street("Vicolo Corto", "Alba")),
                (45.01005, street("Via Roma", "Alba")),
                (45.01505, None),
                (46.0, street("SP 7 - Strada del Colle", "Bra")),
            ],
            fail_below: None,
        };
        let mut classifier = classifier(geo);
        let points = northbound(200);
        let book = build_roadbook(&points, &mut classifier, &Params::default(), &mut NoProgress)
            .unwrap();

        let roads: Vec<_> = book.blocks.iter().map(|b| b.classification.road.as_str()).collect();
        assert_eq!(roads, ["Via Roma", UNKNOWN_ROAD, "Strada del Colle"]);
        assert_eq!(book.stats.discarded_blocks, 1);

        assert_eq!(book.rows.len(), 2);
        assert_eq!(book.rows[0].start_km, 0.0);
        assert_eq!(book.rows[0].etas, vec!["09:00", "09:00", "09:00"]);
        assert_eq!(book.rows[1].road_class, "SP7");
        assert_eq!(book.rows[1].municipality, "Bra");

        assert_eq!(book.blocks[0].start_km, 0.0);
        for w in book.blocks.windows(2) {
            assert_eq!(w[0].end_km, w[1].start_km);
        }
        assert_eq!(book.blocks.last().unwrap().end_km, book.total_km);
    }

    #[test]
    fn failing_lookups_degrade_to_unknown() {
        let geo = BandGeocoder {
            bands: vec![(46.0, street("Via Roma", "Alba"))],
            fail_below: Some(45.00195),
        };
        let mut classifier = classifier(geo);
        let points = northbound(60);
        let book = build_roadbook(&points, &mut classifier, &Params::default(), &mut NoProgress)
            .unwrap();
        assert_eq!(book.stats.degraded_lookups, 20);
        assert_eq!(book.blocks.len(), 2);
        assert_eq!(book.blocks[0].classification, Classification::unknown());
        assert_eq!(book.rows.len(), 1);
        assert_eq!(book.rows[0].road, "Via Roma");
    }

    #[test]
    fn empty_track_yields_empty_roadbook() {
        let geo = BandGeocoder {
            bands: Vec::new(),
            fail_below: None,
        };
        let book =
            build_roadbook(&[], &mut classifier(geo), &Params::default(), &mut NoProgress).unwrap();
        assert!(book.is_empty());
        assert!(book.rows.is_empty());
    }

    #[test]
    fn rejects_invalid_params_before_any_lookup() {
        let geo = BandGeocoder {
            bands: vec![(46.0, street("Via Roma", "Alba"))],
            fail_below: None,
        };
        let mut classifier = classifier(geo);
        let params = Params {
            start_time: "late".into(),
            ..Params::default()
        };
        let result = build_roadbook(&northbound(5), &mut classifier, &params, &mut NoProgress);
        assert!(matches!(result, Err(RoadbookError::InvalidParameter(_))));
        assert_eq!(classifier.lookup().calls(), 0);
    }

    #[test]
    fn progress_sees_every_point() {
        struct Count(usize, bool);
        impl Progress for Count {
            fn advance(&mut self, processed: usize, total: usize) {
                assert_eq!(total, 10);
                self.0 = processed;
            }
            fn finish(&mut self) {
                self.1 = true;
            }
        }
        let geo = BandGeocoder {
            bands: vec![(46.0, street("Via Roma", "Alba"))],
            fail_below: None,
        };
        let mut progress = Count(0, false);
        build_roadbook(&northbound(10), &mut classifier(geo), &Params::default(), &mut progress)
            .unwrap();
        assert_eq!(progress.0, 10);
        assert!(progress.1);
    }

    #[test]
    fn params_round_trip_through_json_with_defaults() {
        let params: Params = serde_json::from_str(r#"{"speeds_kmh": [25, 30]}"#).unwrap();
        assert_eq!(params.speeds_kmh, vec![25.0, 30.0]);
        assert_eq!(params.min_block_m, 50.0);
        assert!(params.validate().is_ok());
    }
}
