use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::Error;

/// A single validated weather observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationPoint {
    pub timestamp: DateTime<Utc>,
    /// Air temperature in °C.
    pub temperature: f64,
    /// Relative humidity in percent.
    pub humidity: f64,
    /// Wind speed in m/s.
    pub wind_speed: f64,
}

/// An observation as it arrives from a provider or a CSV row, before
/// validation. Any measurement may be missing.
#[derive(Debug, Clone, Deserialize)]
pub struct RawObservation {
    pub timestamp: DateTime<Utc>,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub wind_speed: Option<f64>,
}

impl TryFrom<RawObservation> for ObservationPoint {
    type Error = Error;

    fn try_from(raw: RawObservation) -> Result<Self, Self::Error> {
        let measure = |value: Option<f64>, field: &'static str| match value {
            Some(v) if v.is_finite() => Ok(v),
            _ => Err(Error::Validation {
                timestamp: raw.timestamp.to_rfc3339(),
                field,
            }),
        };

        Ok(ObservationPoint {
            temperature: measure(raw.temperature, "temperature")?,
            humidity: measure(raw.humidity, "humidity")?,
            wind_speed: measure(raw.wind_speed, "wind_speed")?,
            timestamp: raw.timestamp,
        })
    }
}

/// Chronologically ordered observations for one location and horizon.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObservationSet {
    pub points: Vec<ObservationPoint>,
}

impl ObservationSet {
    pub fn new(points: Vec<ObservationPoint>) -> Self {
        Self { points }
    }

    /// Validates raw records, keeping source order. Returns the set and the
    /// rejected records' errors; a rejected point never enters the set.
    pub fn from_raw<I>(raw: I) -> (Self, Vec<Error>)
    where
        I: IntoIterator<Item = RawObservation>,
    {
        let mut points = Vec::new();
        let mut rejected = Vec::new();

        for record in raw {
            match ObservationPoint::try_from(record) {
                Ok(point) => points.push(point),
                Err(err) => rejected.push(err),
            }
        }

        (Self::new(points), rejected)
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn first(&self) -> Option<&ObservationPoint> {
        self.points.first()
    }

    pub fn last(&self) -> Option<&ObservationPoint> {
        self.points.last()
    }

    /// Content fingerprint over the point data only. Timestamps are encoded
    /// in canonical RFC 3339 UTC form and measurements by their exact bit
    /// patterns, so any differing value yields a different key.
    pub fn fingerprint(&self) -> ContentKey {
        let mut hasher = Sha256::new();
        hasher.update((self.points.len() as u64).to_le_bytes());
        for point in &self.points {
            hasher.update(
                point
                    .timestamp
                    .to_rfc3339_opts(SecondsFormat::AutoSi, true)
                    .as_bytes(),
            );
            hasher.update([0u8]);
            hasher.update(point.temperature.to_bits().to_le_bytes());
            hasher.update(point.humidity.to_bits().to_le_bytes());
            hasher.update(point.wind_speed.to_bits().to_le_bytes());
        }
        ContentKey(hex::encode(hasher.finalize()))
    }
}

/// Hex-encoded SHA-256 of an observation set's content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentKey(String);

impl ContentKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(16)]
    }
}

impl From<String> for ContentKey {
    fn from(value: String) -> Self {
        ContentKey(value)
    }
}

impl fmt::Display for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Time to flashover, in minutes, at one observation timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RiskPoint {
    pub timestamp: DateTime<Utc>,
    pub ttf: f64,
}

/// Risk points index-aligned with the observation set they derive from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RiskSeries {
    pub points: Vec<RiskPoint>,
}

impl RiskSeries {
    pub fn new(points: Vec<RiskPoint>) -> Self {
        Self { points }
    }

    pub fn latest(&self) -> Option<&RiskPoint> {
        self.points.last()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    /// Meters above sea level.
    #[serde(default)]
    pub altitude: i32,
}

impl Location {
    /// File and topic friendly form of the name.
    pub fn slug(&self) -> String {
        self.name
            .trim()
            .to_lowercase()
            .chars()
            .map(|c| if c.is_alphanumeric() { c } else { '_' })
            .collect()
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (lat={}, lon={})",
            self.name, self.latitude, self.longitude
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LocationList {
    pub locations: Vec<Location>,
}
