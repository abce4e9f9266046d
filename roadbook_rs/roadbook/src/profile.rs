//! Annotations for the elevation profile: the localities a track crosses and
//! its most prominent summits.

use std::cmp::Reverse;
use std::collections::HashSet;

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cache::CoordCache;
use crate::distance::cumulative_distances;
use crate::geocode::{first_present, AddressRecord, LookupError, ReverseGeocoder, Throttle, ThrottledLookup};
use crate::{Params, Progress, RoadbookError, TrackPoint};

/// Label used for a summit whose surroundings cannot be named.
pub const DEFAULT_MARKER_LABEL: &str = "GPM";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LocalityLabel {
    pub index: usize,
    pub km: f64,
    pub name: String,
    /// `"<name> (<km> km)"`.
    pub label: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClimbMarker {
    pub index: usize,
    pub km: f64,
    pub elevation_m: f64,
    pub label: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfileAnnotations {
    /// Ordered by point index; one per distinct municipality.
    pub labels: Vec<LocalityLabel>,
    /// Ordered by descending elevation.
    pub markers: Vec<ClimbMarker>,
    pub distances_km: Vec<f64>,
    pub elevations_m: Vec<Option<f64>>,
    pub total_km: f64,
    pub min_elevation_m: Option<f64>,
    pub max_elevation_m: Option<f64>,
}

/// Cached reverse geocoder that keeps the raw record, absent answers included.
pub struct LocalityResolver<G, T> {
    lookup: ThrottledLookup<G, T>,
    cache: CoordCache<Option<AddressRecord>>,
}

impl<G: ReverseGeocoder, T: Throttle> LocalityResolver<G, T> {
    pub fn new(lookup: ThrottledLookup<G, T>, precision: u32) -> Result<Self, RoadbookError> {
        Ok(Self {
            lookup,
            cache: CoordCache::new(precision)?,
        })
    }

    pub fn resolve(&mut self, lat: f64, lon: f64) -> Result<Option<AddressRecord>, LookupError> {
        let key = self.cache.key(lat, lon);
        if let Some(hit) = self.cache.get(key) {
            return Ok(hit.clone());
        }
        let record = self.lookup.reverse(lat, lon)?;
        self.cache.insert(key, record.clone());
        Ok(record)
    }

    pub fn lookup(&self) -> &ThrottledLookup<G, T> {
        &self.lookup
    }

    pub fn cache(&self) -> &CoordCache<Option<AddressRecord>> {
        &self.cache
    }
}

/// Municipality name as shown on the profile.
pub fn profile_municipality(record: &AddressRecord) -> Option<&str> {
    first_present([&record.town, &record.city, &record.village, &record.municipality])
}

/// Most local name available for a summit.
pub fn marker_locality(record: &AddressRecord) -> Option<&str> {
    first_present([
        &record.hamlet,
        &record.suburb,
        &record.village,
        &record.town,
        &record.city,
    ])
}

/// Label the first sample of every distinct municipality, resolving one
/// point every `stride`. Samples whose lookup fails are skipped.
pub fn locality_labels<G: ReverseGeocoder, T: Throttle>(
    points: &[TrackPoint],
    distances_m: &[f64],
    resolver: &mut LocalityResolver<G, T>,
    stride: usize,
    progress: &mut dyn Progress,
) -> Vec<LocalityLabel> {
    let stride = stride.max(1);
    let total = points.len().div_ceil(stride);
    let mut seen: HashSet<String> = HashSet::new();
    let mut labels = Vec::new();

    for (done, idx) in (0..points.len()).step_by(stride).enumerate() {
        progress.advance(done + 1, total);
        let point = &points[idx];
        let record = match resolver.resolve(point.lat, point.lon) {
            Ok(Some(record)) => record,
            Ok(None) => continue,
            Err(err) => {
                warn!(lat = point.lat, lon = point.lon, "skipping locality sample: {err}");
                continue;
            }
        };
        let Some(name) = profile_municipality(&record) else {
            continue;
        };
        if seen.insert(name.to_string()) {
            let km = distances_m.get(idx).copied().unwrap_or(0.0) / 1000.0;
            debug!(idx, km, name, "new locality");
            labels.push(LocalityLabel {
                index: idx,
                km,
                name: name.to_string(),
                label: format!("{name} ({km:.1} km)"),
            });
        }
    }
    progress.finish();
    labels
}

/// Indices of local maxima, highest first, at most `max`.
///
/// A candidate is strictly higher than both neighbours; the first and last
/// samples never qualify, and samples without elevation are ignored both as
/// candidates and as neighbours.
pub fn peak_candidates(elevations: &[Option<f64>], max: usize) -> Vec<usize> {
    let n = elevations.len();
    if n < 3 || max == 0 {
        return Vec::new();
    }
    let mut order: Vec<usize> = (0..n).filter(|&i| elevations[i].is_some()).collect();
    // Stable: equal elevations keep track order.
    order.sort_by_key(|&i| Reverse(OrderedFloat(elevations[i].unwrap_or(f64::NEG_INFINITY))));

    let mut peaks = Vec::with_capacity(max);
    for i in order {
        if i == 0 || i == n - 1 {
            continue;
        }
        let (Some(prev), Some(here), Some(next)) = (elevations[i - 1], elevations[i], elevations[i + 1])
        else {
            continue;
        };
        if prev < here && next < here {
            peaks.push(i);
            if peaks.len() >= max {
                break;
            }
        }
    }
    peaks
}

/// Summit markers with a best-effort locality label.
pub fn climb_markers<G: ReverseGeocoder, T: Throttle>(
    points: &[TrackPoint],
    distances_m: &[f64],
    resolver: &mut LocalityResolver<G, T>,
    max: usize,
) -> Vec<ClimbMarker> {
    let elevations: Vec<Option<f64>> = points.iter().map(|p| p.elevation).collect();
    peak_candidates(&elevations, max)
        .into_iter()
        .map(|idx| {
            let point = &points[idx];
            let label = match resolver.resolve(point.lat, point.lon) {
                Ok(Some(record)) => marker_locality(&record)
                    .unwrap_or(DEFAULT_MARKER_LABEL)
                    .to_string(),
                Ok(None) => DEFAULT_MARKER_LABEL.to_string(),
                Err(err) => {
                    warn!(idx, "summit lookup failed: {err}");
                    DEFAULT_MARKER_LABEL.to_string()
                }
            };
            ClimbMarker {
                index: idx,
                km: distances_m.get(idx).copied().unwrap_or(0.0) / 1000.0,
                elevation_m: point.elevation.unwrap_or_default(),
                label,
            }
        })
        .collect()
}

/// Everything the profile chart needs.
pub fn annotate_profile<G: ReverseGeocoder, T: Throttle>(
    points: &[TrackPoint],
    resolver: &mut LocalityResolver<G, T>,
    params: &Params,
    progress: &mut dyn Progress,
) -> Result<ProfileAnnotations, RoadbookError> {
    params.validate()?;
    if points.is_empty() {
        return Ok(ProfileAnnotations::default());
    }
    let distances_m = cumulative_distances(points);
    let labels = locality_labels(points, &distances_m, resolver, params.profile_stride, progress);
    let markers = climb_markers(points, &distances_m, resolver, params.max_climb_markers);

    let elevations_m: Vec<Option<f64>> = points.iter().map(|p| p.elevation).collect();
    let known = elevations_m.iter().flatten().copied();
    let min_elevation_m = known.clone().min_by_key(|&e| OrderedFloat(e));
    let max_elevation_m = known.max_by_key(|&e| OrderedFloat(e));

    Ok(ProfileAnnotations {
        labels,
        markers,
        total_km: distances_m.last().copied().unwrap_or(0.0) / 1000.0,
        distances_km: distances_m.iter().map(|d| d / 1000.0).collect(),
        elevations_m,
        min_elevation_m,
        max_elevation_m,
    })
}
