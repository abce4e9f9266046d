//! Validity filter and per-speed arrival time projection.

use chrono::{NaiveTime, TimeDelta};
use serde::{Deserialize, Serialize};

use crate::segment::Block;
use crate::RoadbookError;

const MINUTES_PER_DAY: i64 = 24 * 60;

/// One row of the exported road table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SegmentRow {
    pub road: String,
    pub road_class: String,
    pub municipality: String,
    pub sub_locality: String,
    /// Rounded to two decimals.
    pub start_km: f64,
    /// Rounded to two decimals.
    pub end_km: f64,
    /// `HH:MM` arrival time, one per configured speed.
    pub etas: Vec<String>,
}

impl SegmentRow {
    pub fn to_record(&self) -> Vec<String> {
        let mut record = vec![
            self.road.clone(),
            self.road_class.clone(),
            self.municipality.clone(),
            self.sub_locality.clone(),
            format!("{:.2}", self.start_km),
            format!("{:.2}", self.end_km),
        ];
        record.extend(self.etas.iter().cloned());
        record
    }
}

/// Accepts `H:MM` and `HH:MM`.
pub fn parse_start_time(input: &str) -> Result<NaiveTime, RoadbookError> {
    NaiveTime::parse_from_str(input.trim(), "%H:%M").map_err(|e| {
        RoadbookError::InvalidParameter(format!("invalid start time '{input}': {e}"))
    })
}

pub fn validate_speeds(speeds_kmh: &[f64]) -> Result<(), RoadbookError> {
    if speeds_kmh.is_empty() {
        return Err(RoadbookError::InvalidParameter(
            "at least one travel speed is required".into(),
        ));
    }
    if let Some(bad) = speeds_kmh.iter().find(|v| !(v.is_finite() && **v > 0.0)) {
        return Err(RoadbookError::InvalidParameter(format!(
            "travel speeds must be > 0 km/h, got {bad}"
        )));
    }
    Ok(())
}

/// Round to two decimals, ties to even.
pub fn round_km(km: f64) -> f64 {
    (km * 100.0).round_ties_even() / 100.0
}

/// Whole minutes to cover `km` at `speed_kmh`, ties to even (22.5 -> 22).
pub fn eta_minutes(km: f64, speed_kmh: f64) -> i64 {
    (km / speed_kmh * 60.0).round_ties_even() as i64
}

/// Time of day after `minutes`, wrapping past midnight.
pub fn clock_after(start: NaiveTime, minutes: i64) -> String {
    let offset = TimeDelta::minutes(minutes.rem_euclid(MINUTES_PER_DAY));
    (start + offset).format("%H:%M").to_string()
}

#[derive(Clone, Debug)]
pub struct TimingProjector {
    start: NaiveTime,
    speeds_kmh: Vec<f64>,
}

impl TimingProjector {
    pub fn new(start_time: &str, speeds_kmh: &[f64]) -> Result<Self, RoadbookError> {
        validate_speeds(speeds_kmh)?;
        Ok(Self {
            start: parse_start_time(start_time)?,
            speeds_kmh: speeds_kmh.to_vec(),
        })
    }

    pub fn header(&self) -> Vec<String> {
        let mut header: Vec<String> = [
            "Road",
            "RoadClass",
            "Municipality",
            "SubLocality",
            "StartKm",
            "EndKm",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        header.extend(self.speeds_kmh.iter().map(|v| format!("ETA@{v} km/h")));
        header
    }

    /// Arrival labels for a block starting at `start_km`. The start is rounded
    /// to the two decimals shown in the table before projecting.
    pub fn etas(&self, start_km: f64) -> Vec<String> {
        let km = round_km(start_km);
        self.speeds_kmh
            .iter()
            .map(|&speed| clock_after(self.start, eta_minutes(km, speed)))
            .collect()
    }

    /// Drop blocks with neither a road name nor a road class, and project
    /// the rest onto the configured speeds.
    pub fn project(&self, blocks: &[Block]) -> Vec<SegmentRow> {
        blocks
            .iter()
            .filter(|b| b.classification.is_valid())
            .map(|b| SegmentRow {
                road: b.classification.road.clone(),
                road_class: b.classification.road_class.clone(),
                municipality: b.classification.municipality.clone(),
                sub_locality: b.classification.sub_locality.clone(),
                start_km: round_km(b.start_km),
                end_km: round_km(b.end_km),
                etas: self.etas(b.start_km),
            })
            .collect()
    }
}
