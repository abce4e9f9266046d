//! Reverse geocoding seam: the address record consumed by the classifier, the
//! Nominatim HTTP client and the throttling/retry policy wrapped around it.

use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::RoadbookError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LookupError {
    #[error("reverse geocode timed out")]
    Timeout,
    #[error("reverse geocode failed: {0}")]
    Failure(String),
}

/// The subset of a reverse-geocoded address the route engine reads.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressRecord {
    #[serde(default)]
    pub road: Option<String>,
    /// Semicolon separated reference codes, e.g. `"SP 12;SS45"`.
    #[serde(default, rename = "ref")]
    pub reference: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub town: Option<String>,
    #[serde(default)]
    pub village: Option<String>,
    #[serde(default)]
    pub hamlet: Option<String>,
    #[serde(default)]
    pub suburb: Option<String>,
    #[serde(default)]
    pub municipality: Option<String>,
}

/// First candidate that is present and non-empty.
pub(crate) fn first_present<'a, I>(candidates: I) -> Option<&'a str>
where
    I: IntoIterator<Item = &'a Option<String>>,
{
    candidates
        .into_iter()
        .filter_map(|c| c.as_deref())
        .find(|s| !s.is_empty())
}

pub trait ReverseGeocoder {
    /// Resolve a coordinate. `Ok(None)` means the provider answered but has
    /// no address for this location.
    fn reverse(&mut self, lat: f64, lon: f64) -> Result<Option<AddressRecord>, LookupError>;
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NominatimConfig {
    pub endpoint: String,
    pub user_agent: String,
    pub language: String,
    pub timeout_s: f64,
    /// Minimum spacing between two external calls.
    pub delay_s: f64,
    pub max_attempts: u32,
    pub retry_backoff_s: f64,
}

impl Default for NominatimConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://nominatim.openstreetmap.org/reverse".to_string(),
            user_agent: concat!("roadbook/", env!("CARGO_PKG_VERSION")).to_string(),
            language: "it".to_string(),
            timeout_s: 10.0,
            delay_s: 1.0,
            max_attempts: 3,
            retry_backoff_s: 1.0,
        }
    }
}

impl NominatimConfig {
    pub fn validate(&self) -> Result<(), RoadbookError> {
        if !(self.timeout_s.is_finite() && self.timeout_s > 0.0) {
            return Err(RoadbookError::InvalidParameter(format!(
                "geocode timeout must be > 0 s, got {}",
                self.timeout_s
            )));
        }
        for (name, value) in [("delay", self.delay_s), ("retry backoff", self.retry_backoff_s)] {
            if !(value.is_finite() && value >= 0.0) {
                return Err(RoadbookError::InvalidParameter(format!(
                    "{name} must be >= 0 s, got {value}"
                )));
            }
        }
        if self.max_attempts == 0 {
            return Err(RoadbookError::InvalidParameter(
                "max_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn throttle(&self) -> FixedDelay {
        FixedDelay::new(
            Duration::from_secs_f64(self.delay_s.max(0.0)),
            Duration::from_secs_f64(self.retry_backoff_s.max(0.0)),
        )
    }
}

/// Blocking client for the Nominatim `/reverse` endpoint.
pub struct NominatimGeocoder {
    client: reqwest::blocking::Client,
    endpoint: String,
    language: String,
}

impl NominatimGeocoder {
    pub fn new(config: &NominatimConfig) -> Result<Self, RoadbookError> {
        config.validate()?;
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs_f64(config.timeout_s))
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| RoadbookError::InvalidParameter(format!("http client: {e}")))?;
        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            language: config.language.clone(),
        })
    }
}

impl ReverseGeocoder for NominatimGeocoder {
    fn reverse(&mut self, lat: f64, lon: f64) -> Result<Option<AddressRecord>, LookupError> {
        let lat = lat.to_string();
        let lon = lon.to_string();
        let response = self
            .client
            .get(&self.endpoint)
            .query(&[
                ("format", "jsonv2"),
                ("lat", lat.as_str()),
                ("lon", lon.as_str()),
                ("addressdetails", "1"),
                ("accept-language", self.language.as_str()),
            ])
            .send()
            .map_err(transport_error)?
            .error_for_status()
            .map_err(transport_error)?;
        let body = response.text().map_err(transport_error)?;
        parse_reply(&body)
    }
}

fn transport_error(err: reqwest::Error) -> LookupError {
    if err.is_timeout() {
        LookupError::Timeout
    } else {
        LookupError::Failure(err.to_string())
    }
}

#[derive(Deserialize)]
struct NominatimReply {
    #[serde(default)]
    address: Option<AddressRecord>,
    #[serde(default)]
    error: Option<String>,
}

/// Decode a `/reverse` JSON body. A body without an address object is a
/// valid "nothing here" answer, not a failure.
pub fn parse_reply(body: &str) -> Result<Option<AddressRecord>, LookupError> {
    let reply: NominatimReply =
        serde_json::from_str(body).map_err(|e| LookupError::Failure(e.to_string()))?;
    if let Some(message) = reply.error.as_deref() {
        debug!("provider returned no address: {message}");
    }
    Ok(reply.address)
}

/// Rate limiting policy consulted around every external call.
pub trait Throttle {
    /// Called right before an external call is issued.
    fn before_call(&mut self);
    /// Called after a timed-out attempt that will be retried.
    fn after_timeout(&mut self);
}

/// Never sleeps. Intended for tests and local geocoders.
#[derive(Clone, Copy, Debug, Default)]
pub struct Unthrottled;

impl Throttle for Unthrottled {
    fn before_call(&mut self) {}
    fn after_timeout(&mut self) {}
}

/// Keeps at least `delay` between the starts of consecutive calls and sleeps
/// `backoff` after a timeout.
#[derive(Clone, Debug)]
pub struct FixedDelay {
    delay: Duration,
    backoff: Duration,
    last_call: Option<Instant>,
}

impl FixedDelay {
    pub fn new(delay: Duration, backoff: Duration) -> Self {
        Self {
            delay,
            backoff,
            last_call: None,
        }
    }
}

impl Throttle for FixedDelay {
    fn before_call(&mut self) {
        if let Some(last) = self.last_call {
            let elapsed = last.elapsed();
            if elapsed < self.delay {
                thread::sleep(self.delay - elapsed);
            }
        }
        self.last_call = Some(Instant::now());
    }

    fn after_timeout(&mut self) {
        if !self.backoff.is_zero() {
            thread::sleep(self.backoff);
        }
    }
}

/// A geocoder behind a throttle, retrying timeouts up to `max_attempts`.
pub struct ThrottledLookup<G, T> {
    geocoder: G,
    throttle: T,
    max_attempts: u32,
    calls: usize,
}

impl<G: ReverseGeocoder, T: Throttle> ThrottledLookup<G, T> {
    pub fn new(geocoder: G, throttle: T, max_attempts: u32) -> Self {
        Self {
            geocoder,
            throttle,
            max_attempts: max_attempts.max(1),
            calls: 0,
        }
    }

    pub fn reverse(&mut self, lat: f64, lon: f64) -> Result<Option<AddressRecord>, LookupError> {
        for attempt in 1..=self.max_attempts {
            self.throttle.before_call();
            self.calls += 1;
            match self.geocoder.reverse(lat, lon) {
                Err(LookupError::Timeout) if attempt < self.max_attempts => {
                    debug!(lat, lon, attempt, "reverse geocode timed out, retrying");
                    self.throttle.after_timeout();
                }
                other => return other,
            }
        }
        Err(LookupError::Timeout)
    }

    /// External calls issued so far, retries included.
    pub fn calls(&self) -> usize {
        self.calls
    }

    pub fn geocoder(&self) -> &G {
        &self.geocoder
    }
}
