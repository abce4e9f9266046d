//! Point classification: turns a coordinate into the (road, road class,
//! municipality, sub-locality) tuple the block builder folds over.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::cache::CoordCache;
use crate::geocode::{first_present, AddressRecord, LookupError, ReverseGeocoder, Throttle, ThrottledLookup};
use crate::RoadbookError;

pub const UNKNOWN_ROAD: &str = "Unknown";
pub const UNKNOWN_MUNICIPALITY: &str = "Unknown locality";

/// Reference code at the start of one `ref` candidate, e.g. `SP 012`.
static REF_CODE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(SP|SS|SR|SPP|SPRR)[.\s]*0*(\d+)").expect("valid ref pattern")
});

/// Code anywhere inside a road name, dotted forms included.
static NAME_CODE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(SP|SS|SR|SPP|SPRR|S\.P\.|S\.S\.)[\s.]*0*(\d+)").expect("valid name pattern")
});

/// Leading code plus an optional dash/colon separator.
static LEADING_CODE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(SP|SS|SR|SPP|SPRR|S\.P\.|S\.S\.)[\s.]*0*\d+\s*[-\x{2013}:]?\s*")
        .expect("valid prefix pattern")
});

/// Semantic labels of a track point. Equality is exact on all four fields.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Classification {
    pub road: String,
    /// Normalised code such as `SP12`, empty when absent.
    pub road_class: String,
    pub municipality: String,
    /// Empty when absent.
    pub sub_locality: String,
}

impl Classification {
    pub fn unknown() -> Self {
        Self {
            road: UNKNOWN_ROAD.to_string(),
            road_class: String::new(),
            municipality: UNKNOWN_MUNICIPALITY.to_string(),
            sub_locality: String::new(),
        }
    }

    /// A block is worth reporting if it has a road name or at least a code.
    pub fn is_valid(&self) -> bool {
        self.road != UNKNOWN_ROAD || !self.road_class.is_empty()
    }
}

impl Default for Classification {
    fn default() -> Self {
        Self::unknown()
    }
}

/// Apply the extraction rules to one raw address record.
pub fn classify_address(record: &AddressRecord) -> Classification {
    let raw_road = record
        .road
        .as_deref()
        .filter(|r| !r.is_empty())
        .unwrap_or(UNKNOWN_ROAD);
    let road_class = extract_road_class(record.reference.as_deref(), raw_road).unwrap_or_default();
    let road = clean_road_name(raw_road);

    let municipality = first_present([&record.city, &record.town, &record.village, &record.hamlet])
        .unwrap_or(UNKNOWN_MUNICIPALITY)
        .to_string();
    let sub_locality = first_present([&record.suburb, &record.hamlet])
        .unwrap_or_default()
        .to_string();

    Classification {
        road,
        road_class,
        municipality,
        sub_locality,
    }
}

/// Road class from the `ref` list (first matching candidate wins), falling
/// back to a code embedded in the road name.
pub fn extract_road_class(reference: Option<&str>, raw_road: &str) -> Option<String> {
    if let Some(refs) = reference {
        let from_ref = refs.split(';').find_map(|candidate| {
            let caps = REF_CODE.captures(candidate.trim())?;
            Some(normalise_code(&caps[1], &caps[2]))
        });
        if from_ref.is_some() {
            return from_ref;
        }
    }
    NAME_CODE
        .captures(raw_road)
        .map(|caps| normalise_code(&caps[1], &caps[2]))
}

fn normalise_code(code: &str, digits: &str) -> String {
    let code: String = code
        .to_uppercase()
        .chars()
        .filter(|c| *c != '.' && *c != ' ')
        .collect();
    let number = digits.trim_start_matches('0');
    format!("{}{}", code, if number.is_empty() { "0" } else { number })
}

/// Strip a leading road code (`SP12 - `, `S.S. 45:` ...) from a road name.
pub fn clean_road_name(raw: &str) -> String {
    let cleaned = LEADING_CODE.replace(raw, "");
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        UNKNOWN_ROAD.to_string()
    } else {
        cleaned.to_string()
    }
}

/// Cached, throttled classifier for track points.
pub struct PointClassifier<G, T> {
    lookup: ThrottledLookup<G, T>,
    cache: CoordCache<Classification>,
}

impl<G: ReverseGeocoder, T: Throttle> PointClassifier<G, T> {
    pub fn new(lookup: ThrottledLookup<G, T>, precision: u32) -> Result<Self, RoadbookError> {
        Ok(Self {
            lookup,
            cache: CoordCache::new(precision)?,
        })
    }

    /// Classify one coordinate. Cache hits never reach the geocoder (and so
    /// never wait on the throttle). Only resolved addresses are cached.
    pub fn classify(&mut self, lat: f64, lon: f64) -> Result<Classification, LookupError> {
        let key = self.cache.key(lat, lon);
        if let Some(hit) = self.cache.get(key) {
            return Ok(hit.clone());
        }
        match self.lookup.reverse(lat, lon)? {
            Some(record) => {
                let classification = classify_address(&record);
                self.cache.insert(key, classification.clone());
                Ok(classification)
            }
            None => Ok(Classification::unknown()),
        }
    }

    pub fn cache(&self) -> &CoordCache<Classification> {
        &self.cache
    }

    pub fn lookup(&self) -> &ThrottledLookup<G, T> {
        &self.lookup
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geocode::tests::{road, CountingThrottle, FakeGeocoder};
    use crate::geocode::Unthrottled;

    fn classifier(fake: FakeGeocoder) -> PointClassifier<FakeGeocoder, Unthrottled> {
        PointClassifier::new(ThrottledLookup::new(fake, Unthrottled, 3), 5).unwrap()
    }

    #[test]
    fn first_matching_reference_wins() {
        assert_eq!(
            extract_road_class(Some("SP 12; SS45"), "Via Roma").as_deref(),
            Some("SP12")
        );
        assert_eq!(
            extract_road_class(Some("E70;ss 045"), "Via Roma").as_deref(),
            Some("SS45")
        );
        assert_eq!(extract_road_class(Some("SPRR 3"), "x").as_deref(), Some("SPRR3"));
        assert_eq!(extract_road_class(Some("SPP.07"), "x").as_deref(), Some("SPP7"));
    }

    #[test]
    fn falls_back_to_code_in_road_name() {
        assert_eq!(
            extract_road_class(Some("A4;E64"), "Strada S.P. 012 del Colle").as_deref(),
            Some("SP12")
        );
        assert_eq!(extract_road_class(None, "ss 45").as_deref(), Some("SS45"));
        assert_eq!(extract_road_class(None, "Via Caspio"), None);
        assert_eq!(extract_road_class(None, "SP0").as_deref(), Some("SP0"));
    }

    #[test]
    fn strips_leading_code_from_name() {
        assert_eq!(clean_road_name("SP12 - Via Roma"), "Via Roma");
        assert_eq!(clean_road_name("S.S. 045: Strada del Sole"), "Strada del Sole");
        assert_eq!(clean_road_name("SR 2 \u{2013} Cassia"), "Cassia");
        assert_eq!(clean_road_name("Via Roma SP12"), "Via Roma SP12");
        assert_eq!(clean_road_name("SP 7"), UNKNOWN_ROAD);
    }

    #[test]
    fn classify_address_applies_priorities() {
        let record = AddressRecord {
            road: Some("SP7 - Strada Provinciale".into()),
            city: None,
            town: Some("Alba".into()),
            village: Some("Mussotto".into()),
            hamlet: Some("Borgo".into()),
            ..AddressRecord::default()
        };
        let c = classify_address(&record);
        assert_eq!(c.road, "Strada Provinciale");
        assert_eq!(c.road_class, "SP7");
        assert_eq!(c.municipality, "Alba");
        assert_eq!(c.sub_locality, "Borgo");
    }

    #[test]
    fn empty_record_is_unknown() {
        let c = classify_address(&AddressRecord::default());
        assert_eq!(c, Classification::unknown());
        assert!(!c.is_valid());
    }

    #[test]
    fn code_only_road_is_still_valid() {
        let record = AddressRecord {
            road: Some("SP 7".into()),
            ..AddressRecord::default()
        };
        let c = classify_address(&record);
        assert_eq!(c.road, UNKNOWN_ROAD);
        assert_eq!(c.road_class, "SP7");
        assert!(c.is_valid());
    }

    #[test]
    fn cache_hit_skips_geocoder() {
        let fake = FakeGeocoder {
            default: Some(road("Via Po", "Torino")),
            ..FakeGeocoder::default()
        };
        let mut classifier = classifier(fake);
        let a = classifier.classify(45.070_001, 7.686_001).unwrap();
        let b = classifier.classify(45.070_002, 7.686_002).unwrap();
        assert_eq!(a, b);
        assert_eq!(classifier.lookup().calls(), 1);
        assert_eq!(classifier.cache().hits(), 1);
    }

    #[test]
    fn cache_hit_is_not_throttled() {
        let fake = FakeGeocoder {
            default: Some(road("Corso Francia", "Rivoli")),
            ..FakeGeocoder::default()
        };
        let counter = CountingThrottle::default();
        let lookup = ThrottledLookup::new(fake, counter.clone(), 3);
        let mut classifier = PointClassifier::new(lookup, 5).unwrap();
        classifier.classify(45.07, 7.52).unwrap();
        assert_eq!(counter.before_call.get(), 1);
        for _ in 0..4 {
            classifier.classify(45.07, 7.52).unwrap();
        }
        assert_eq!(counter.before_call.get(), 1);
        assert_eq!(counter.after_timeout.get(), 0);
        assert_eq!(classifier.cache().hits(), 4);
    }

    #[test]
    fn absent_address_is_unknown_and_not_cached() {
        let mut fake = FakeGeocoder::default();
        fake.script.push_back(Ok(None));
        fake.script.push_back(Ok(Some(road("Via Po", "Torino"))));
        let mut classifier = classifier(fake);
        assert_eq!(classifier.classify(45.0, 7.0).unwrap(), Classification::unknown());
        assert_eq!(classifier.classify(45.0, 7.0).unwrap().road, "Via Po");
        assert_eq!(classifier.lookup().calls(), 2);
    }

    #[test]
    fn failures_surface_as_errors() {
        let mut fake = FakeGeocoder::default();
        fake.script.push_back(Err(LookupError::Failure("boom".into())));
        let mut classifier = classifier(fake);
        assert!(classifier.classify(45.0, 7.0).is_err());
        assert!(classifier.cache().is_empty());
    }
}
