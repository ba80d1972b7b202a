//! Observation fetching.
//!
//! [`MetNoClient`] reads the MET Norway Locationforecast compact product and
//! converts its timeseries into validated observation sets. [`FrostClient`]
//! looks back over hourly station observations from the Frost API instead.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::models::{Location, ObservationSet, RawObservation};

#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetches observations for `location` covering `horizon_hours` from the
    /// first returned timestamp. An empty result is an error.
    async fn fetch(&self, location: &Location, horizon_hours: u32) -> Result<ObservationSet>;
}

pub const MET_BASE_URL: &str = "https://api.met.no/weatherapi/locationforecast/2.0/compact";
pub const MET_USER_AGENT: &str = "frcm-worker/0.1 github.com/isak148/firegurad";
pub const FROST_BASE_URL: &str = "https://frost.met.no/observations/v0.jsonld";

const FROST_ELEMENTS: &str = "air_temperature,relative_humidity,wind_speed";

#[derive(Debug, Clone)]
pub struct MetNoClient {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
pub struct ForecastResponse {
    pub properties: ForecastProperties,
}

#[derive(Debug, Deserialize)]
pub struct ForecastProperties {
    #[serde(default)]
    pub timeseries: Vec<TimeseriesEntry>,
}

#[derive(Debug, Deserialize)]
pub struct TimeseriesEntry {
    pub time: DateTime<Utc>,
    pub data: TimeseriesData,
}

#[derive(Debug, Deserialize)]
pub struct TimeseriesData {
    pub instant: Instant,
}

#[derive(Debug, Deserialize)]
pub struct Instant {
    #[serde(default)]
    pub details: InstantDetails,
}

#[derive(Debug, Default, Deserialize)]
pub struct InstantDetails {
    pub air_temperature: Option<f64>,
    pub relative_humidity: Option<f64>,
    pub wind_speed: Option<f64>,
}

impl MetNoClient {
    pub fn new(user_agent: &str) -> Result<Self> {
        Self::with_base_url(user_agent, MET_BASE_URL)
    }

    pub fn with_base_url(user_agent: &str, base_url: &str) -> Result<Self> {
        Ok(Self {
            client: http_client(user_agent)?,
            base_url: base_url.to_string(),
        })
    }
}

#[async_trait]
impl Fetcher for MetNoClient {
    async fn fetch(&self, location: &Location, horizon_hours: u32) -> Result<ObservationSet> {
        let mut query = vec![
            ("lat", location.latitude.to_string()),
            ("lon", location.longitude.to_string()),
        ];
        if location.altitude > 0 {
            query.push(("altitude", location.altitude.to_string()));
        }

        debug!(location = %location, "fetching MET forecast");

        let resp = self
            .client
            .get(&self.base_url)
            .query(&query)
            .send()
            .await
            .map_err(|e| Error::fetch(&location.name, e))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::fetch(
                &location.name,
                format!(
                    "MET returned {}: {}",
                    status,
                    body.chars().take(500).collect::<String>()
                ),
            ));
        }

        let forecast: ForecastResponse = resp
            .json()
            .await
            .map_err(|e| Error::fetch(&location.name, format!("bad MET response: {e}")))?;

        parse_forecast(&location.name, forecast, horizon_hours)
    }
}

fn http_client(user_agent: &str) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(user_agent)
        .timeout(std::time::Duration::from_secs(30))
        .build()
        .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))
}

/// Historical hourly observations from the station nearest each location.
/// The horizon is a lookback window ending now.
#[derive(Debug, Clone)]
pub struct FrostClient {
    client: reqwest::Client,
    base_url: String,
    client_id: String,
}

#[derive(Debug, Deserialize)]
pub struct FrostResponse {
    #[serde(default)]
    pub data: Vec<FrostItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrostItem {
    pub reference_time: DateTime<Utc>,
    #[serde(default)]
    pub observations: Vec<FrostObservation>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrostObservation {
    pub element_id: String,
    pub value: f64,
}

impl FrostClient {
    pub fn new(client_id: &str, user_agent: &str) -> Result<Self> {
        Self::with_base_url(client_id, user_agent, FROST_BASE_URL)
    }

    pub fn with_base_url(client_id: &str, user_agent: &str, base_url: &str) -> Result<Self> {
        Ok(Self {
            client: http_client(user_agent)?,
            base_url: base_url.to_string(),
            client_id: client_id.to_string(),
        })
    }
}

/// Query parameters for a Frost observations request. Rejects coordinates
/// outside the valid latitude and longitude ranges.
pub fn frost_query(
    location: &Location,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<Vec<(&'static str, String)>> {
    if !(-90.0..=90.0).contains(&location.latitude) {
        return Err(Error::fetch(
            &location.name,
            format!("invalid latitude {}", location.latitude),
        ));
    }
    if !(-180.0..=180.0).contains(&location.longitude) {
        return Err(Error::fetch(
            &location.name,
            format!("invalid longitude {}", location.longitude),
        ));
    }

    let format = "%Y-%m-%dT%H:%M:%S";
    Ok(vec![
        (
            "referencetime",
            format!("{}/{}", start.format(format), end.format(format)),
        ),
        ("elements", FROST_ELEMENTS.to_string()),
        (
            "geometry",
            format!("nearest(POINT({} {}))", location.longitude, location.latitude),
        ),
        ("timeresolutions", "PT1H".to_string()),
    ])
}

#[async_trait]
impl Fetcher for FrostClient {
    async fn fetch(&self, location: &Location, horizon_hours: u32) -> Result<ObservationSet> {
        let end = Utc::now();
        let start = end - Duration::hours(i64::from(horizon_hours));
        let query = frost_query(location, start, end)?;

        info!(location = %location, horizon_hours, "fetching Frost observations");

        let resp = self
            .client
            .get(&self.base_url)
            .basic_auth(&self.client_id, Some(""))
            .query(&query)
            .send()
            .await
            .map_err(|e| Error::fetch(&location.name, e))?;

        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(Error::fetch(
                &location.name,
                "Frost rejected the client id; request one at https://frost.met.no/auth/requestCredentials.html",
            ));
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::fetch(
                &location.name,
                format!(
                    "Frost returned {}: {}",
                    status,
                    body.chars().take(500).collect::<String>()
                ),
            ));
        }

        let observations: FrostResponse = resp
            .json()
            .await
            .map_err(|e| Error::fetch(&location.name, format!("bad Frost response: {e}")))?;

        parse_observations(&location.name, observations)
    }
}

/// Merges the per-element Frost values into one point per reference time,
/// in chronological order. Times missing an element are dropped.
pub fn parse_observations(location: &str, response: FrostResponse) -> Result<ObservationSet> {
    let mut by_time: BTreeMap<DateTime<Utc>, RawObservation> = BTreeMap::new();

    for item in response.data {
        let raw = by_time
            .entry(item.reference_time)
            .or_insert_with(|| RawObservation {
                timestamp: item.reference_time,
                temperature: None,
                humidity: None,
                wind_speed: None,
            });
        for observation in item.observations {
            let slot = match observation.element_id.as_str() {
                "air_temperature" => &mut raw.temperature,
                "relative_humidity" => &mut raw.humidity,
                "wind_speed" => &mut raw.wind_speed,
                _ => continue,
            };
            slot.get_or_insert(observation.value);
        }
    }

    let (set, rejected) = ObservationSet::from_raw(by_time.into_values());
    for err in &rejected {
        debug!(location, error = %err, "dropped observation");
    }

    if set.is_empty() {
        return Err(Error::EmptyResult(location.to_string()));
    }

    debug!(
        location,
        points = set.len(),
        dropped = rejected.len(),
        "parsed Frost observations"
    );
    Ok(set)
}

/// Converts a forecast into an observation set, keeping entries within
/// `horizon_hours` of the first one and dropping incomplete points.
pub fn parse_forecast(
    location: &str,
    forecast: ForecastResponse,
    horizon_hours: u32,
) -> Result<ObservationSet> {
    let horizon = Duration::hours(i64::from(horizon_hours));
    let start = forecast.properties.timeseries.first().map(|e| e.time);

    let raw = forecast
        .properties
        .timeseries
        .into_iter()
        .take_while(|entry| start.map_or(true, |start| entry.time - start <= horizon))
        .map(|entry| RawObservation {
            timestamp: entry.time,
            temperature: entry.data.instant.details.air_temperature,
            humidity: entry.data.instant.details.relative_humidity,
            wind_speed: entry.data.instant.details.wind_speed,
        });

    let (set, rejected) = ObservationSet::from_raw(raw);
    for err in &rejected {
        debug!(location, error = %err, "dropped observation");
    }

    if set.is_empty() {
        return Err(Error::EmptyResult(location.to_string()));
    }

    debug!(
        location,
        points = set.len(),
        dropped = rejected.len(),
        "parsed MET forecast"
    );
    Ok(set)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "type": "Feature",
        "properties": {
            "meta": {"updated_at": "2026-01-07T00:00:00Z"},
            "timeseries": [
                {"time": "2026-01-07T00:00:00Z", "data": {"instant": {"details": {
                    "air_temperature": -9.7, "relative_humidity": 85.0, "wind_speed": 0.8}}}},
                {"time": "2026-01-07T01:00:00Z", "data": {"instant": {"details": {
                    "air_temperature": -9.5, "wind_speed": 1.0}}}},
                {"time": "2026-01-07T02:00:00Z", "data": {"instant": {"details": {
                    "air_temperature": -9.1, "relative_humidity": 83.0, "wind_speed": 1.2}}}},
                {"time": "2026-01-07T06:00:00Z", "data": {"instant": {"details": {
                    "air_temperature": -7.0, "relative_humidity": 80.0, "wind_speed": 2.0}}}}
            ]
        }
    }"#;

    #[test]
    fn parses_complete_points_within_horizon() {
        let forecast: ForecastResponse = serde_json::from_str(SAMPLE).unwrap();
        let set = parse_forecast("Bergen", forecast, 3).unwrap();

        assert_eq!(set.len(), 2);
        assert_eq!(set.points[0].temperature, -9.7);
        assert_eq!(set.points[0].humidity, 85.0);
        assert_eq!(set.points[1].wind_speed, 1.2);
    }

    #[test]
    fn long_horizon_keeps_everything_valid() {
        let forecast: ForecastResponse = serde_json::from_str(SAMPLE).unwrap();
        let set = parse_forecast("Bergen", forecast, 48).unwrap();
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn no_valid_points_is_empty_result() {
        let forecast: ForecastResponse = serde_json::from_str(
            r#"{"properties": {"timeseries": [
                {"time": "2026-01-07T00:00:00Z", "data": {"instant": {"details": {"wind_speed": 2.0}}}}
            ]}}"#,
        )
        .unwrap();
        let err = parse_forecast("Oslo", forecast, 48).unwrap_err();
        assert!(matches!(err, Error::EmptyResult(ref name) if name == "Oslo"));
    }

    const FROST_SAMPLE: &str = r#"{
        "@context": "https://frost.met.no/schema",
        "@type": "ObservationResponse",
        "data": [
            {"sourceId": "SN50540:0", "referenceTime": "2026-01-07T01:00:00.000Z", "observations": [
                {"elementId": "air_temperature", "value": -4.1, "unit": "degC"},
                {"elementId": "relative_humidity", "value": 88.0, "unit": "percent"},
                {"elementId": "wind_speed", "value": 2.3, "unit": "m/s"}]},
            {"sourceId": "SN50540:0", "referenceTime": "2026-01-07T00:00:00.000Z", "observations": [
                {"elementId": "air_temperature", "value": -4.5, "unit": "degC"},
                {"elementId": "wind_speed", "value": 2.0, "unit": "m/s"}]},
            {"sourceId": "SN50540:0", "referenceTime": "2026-01-07T00:00:00.000Z", "observations": [
                {"elementId": "relative_humidity", "value": 90.0, "unit": "percent"}]},
            {"sourceId": "SN50540:0", "referenceTime": "2026-01-07T02:00:00.000Z", "observations": [
                {"elementId": "air_temperature", "value": -3.9, "unit": "degC"}]}
        ]
    }"#;

    fn bergen() -> Location {
        Location {
            name: "Bergen".to_string(),
            latitude: 60.3913,
            longitude: 5.3221,
            altitude: 12,
        }
    }

    #[test]
    fn frost_elements_merge_per_reference_time() {
        let response: FrostResponse = serde_json::from_str(FROST_SAMPLE).unwrap();
        let set = parse_observations("Bergen", response).unwrap();

        assert_eq!(set.len(), 2);
        assert_eq!(set.points[0].timestamp.to_rfc3339(), "2026-01-07T00:00:00+00:00");
        assert_eq!(set.points[0].temperature, -4.5);
        assert_eq!(set.points[0].humidity, 90.0);
        assert_eq!(set.points[1].wind_speed, 2.3);
    }

    #[test]
    fn frost_without_data_is_empty_result() {
        let response: FrostResponse = serde_json::from_str(r#"{"data": []}"#).unwrap();
        assert!(matches!(
            parse_observations("Voss", response),
            Err(Error::EmptyResult(ref name)) if name == "Voss"
        ));
    }

    #[test]
    fn frost_query_targets_nearest_station() {
        let start = "2026-01-06T00:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let end = start + Duration::hours(48);
        let query = frost_query(&bergen(), start, end).unwrap();

        assert!(query.contains(&(
            "referencetime",
            "2026-01-06T00:00:00/2026-01-08T00:00:00".to_string()
        )));
        assert!(query.contains(&(
            "elements",
            "air_temperature,relative_humidity,wind_speed".to_string()
        )));
        assert!(query.contains(&("geometry", "nearest(POINT(5.3221 60.3913))".to_string())));
        assert!(query.contains(&("timeresolutions", "PT1H".to_string())));
    }

    #[test]
    fn frost_query_rejects_bad_coordinates() {
        let now = Utc::now();
        let mut location = bergen();
        location.latitude = 91.0;
        assert!(matches!(
            frost_query(&location, now, now),
            Err(Error::Fetch { .. })
        ));

        let mut location = bergen();
        location.longitude = -180.5;
        assert!(frost_query(&location, now, now).is_err());
    }

    #[test]
    fn missing_timeseries_is_empty_result() {
        let forecast: ForecastResponse =
            serde_json::from_str(r#"{"properties": {}}"#).unwrap();
        assert!(matches!(
            parse_forecast("Oslo", forecast, 48),
            Err(Error::EmptyResult(_))
        ));
    }
}
