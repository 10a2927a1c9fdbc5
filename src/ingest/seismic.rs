//! FDSN event web service client (GeoJSON output).
//!
//! Works against any FDSN `fdsnws/event/1/query` endpoint that supports
//! `format=geojson` and `maxradiuskm`, e.g. USGS:
//! https://earthquake.usgs.gov/fdsnws/event/1/
//!
//! Distances are computed here, from the site to each epicentre, so the
//! aggregator only ever sees `(time, magnitude, distance_km)`.

use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;

use super::SeismicSource;
use crate::analysis::haversine_km;
use crate::error::DataSourceError;
use crate::model::{Location, SeismicEvent};

const PROVIDER: &str = "seismic";

// ============================================================================
// GeoJSON Response Structures
// ============================================================================

#[derive(Debug, Deserialize)]
struct FeatureCollection {
    #[serde(default)]
    features: Vec<Feature>,
}

#[derive(Debug, Deserialize)]
struct Feature {
    properties: Properties,
    geometry: Geometry,
}

#[derive(Debug, Deserialize)]
struct Properties {
    /// Null for events still being reviewed.
    mag: Option<f64>,
    /// Origin time, unix milliseconds.
    time: i64,
}

#[derive(Debug, Deserialize)]
struct Geometry {
    /// `[longitude, latitude, depth_km]`
    coordinates: Vec<f64>,
}

// ============================================================================
// Parsing
// ============================================================================

/// Parses a GeoJSON event list, measuring distances from `site`.
///
/// Events without a magnitude or with unusable coordinates are skipped.
pub fn parse_events(body: &str, site: &Location) -> Result<Vec<SeismicEvent>, DataSourceError> {
    let collection: FeatureCollection = serde_json::from_str(body).map_err(|e| DataSourceError::Parse {
        provider: PROVIDER,
        reason: e.to_string(),
    })?;

    let events = collection
        .features
        .into_iter()
        .filter_map(|feature| {
            let magnitude = feature.properties.mag?;
            let time = DateTime::<Utc>::from_timestamp_millis(feature.properties.time)?;
            let (lon, lat) = match feature.geometry.coordinates.as_slice() {
                [lon, lat, ..] => (*lon, *lat),
                _ => return None,
            };
            Some(SeismicEvent {
                time,
                magnitude,
                distance_km: haversine_km(site.latitude, site.longitude, lat, lon),
            })
        })
        .collect();

    Ok(events)
}

// ============================================================================
// API Client
// ============================================================================

pub struct FdsnEventClient {
    client: reqwest::blocking::Client,
    base_url: String,
    radius_km: f64,
    min_magnitude: f64,
}

impl FdsnEventClient {
    pub fn new(base_url: &str, radius_km: f64, min_magnitude: f64, timeout: Duration) -> Result<Self, DataSourceError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DataSourceError::transport(PROVIDER, e))?;
        Ok(Self {
            client,
            base_url: base_url.to_string(),
            radius_km,
            min_magnitude,
        })
    }
}

impl SeismicSource for FdsnEventClient {
    fn events_near(
        &self,
        location: &Location,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<SeismicEvent>, DataSourceError> {
        let response = self
            .client
            .get(&self.base_url)
            .query(&[
                ("format", "geojson".to_string()),
                ("starttime", start.to_rfc3339_opts(SecondsFormat::Secs, true)),
                ("endtime", end.to_rfc3339_opts(SecondsFormat::Secs, true)),
                ("latitude", location.latitude.to_string()),
                ("longitude", location.longitude.to_string()),
                ("maxradiuskm", self.radius_km.to_string()),
                ("minmagnitude", self.min_magnitude.to_string()),
                ("orderby", "time".to_string()),
            ])
            .send()
            .map_err(|e| DataSourceError::transport(PROVIDER, e))?;

        // FDSN services answer 204 when nothing matched.
        if response.status() == reqwest::StatusCode::NO_CONTENT {
            return Ok(Vec::new());
        }
        if !response.status().is_success() {
            return Err(DataSourceError::Http {
                provider: PROVIDER,
                status: response.status().as_u16(),
            });
        }

        let body = response.text().map_err(|e| DataSourceError::transport(PROVIDER, e))?;
        parse_events(&body, location)
    }
}
