//! OpenWeatherMap current-conditions client.
//!
//! API Documentation: https://openweathermap.org/current
//!
//! Only three fields matter for rockfall features: `main.temp` (requested in
//! metric units), `main.humidity` and `rain.1h`. The `rain` block is absent
//! when it hasn't rained, which is read as 0 mm.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use super::{WeatherObservation, WeatherSource};
use crate::error::DataSourceError;
use crate::model::Location;

const PROVIDER: &str = "weather";

// ============================================================================
// API Response Structures
// ============================================================================

#[derive(Debug, Deserialize)]
struct OwmResponse {
    /// Observation time, unix seconds.
    dt: i64,
    main: OwmMain,
    #[serde(default)]
    rain: Option<OwmRain>,
}

#[derive(Debug, Deserialize)]
struct OwmMain {
    temp: f64,
    humidity: f64,
}

#[derive(Debug, Deserialize)]
struct OwmRain {
    #[serde(rename = "1h")]
    one_hour: Option<f64>,
}

// ============================================================================
// Parsing
// ============================================================================

/// Parses a current-conditions response body.
pub fn parse_current(body: &str) -> Result<WeatherObservation, DataSourceError> {
    let parse_error = |reason: String| DataSourceError::Parse {
        provider: PROVIDER,
        reason,
    };

    let response: OwmResponse = serde_json::from_str(body).map_err(|e| parse_error(e.to_string()))?;
    let observed_at = DateTime::<Utc>::from_timestamp(response.dt, 0)
        .ok_or_else(|| parse_error(format!("invalid observation time {}", response.dt)))?;

    let rain_1h_mm = response.rain.and_then(|r| r.one_hour).unwrap_or(0.0);
    if !response.main.temp.is_finite() || !response.main.humidity.is_finite() || !rain_1h_mm.is_finite() {
        return Err(parse_error("non-finite reading".to_string()));
    }

    Ok(WeatherObservation {
        observed_at,
        temperature_c: response.main.temp,
        humidity_pct: response.main.humidity,
        rain_1h_mm,
    })
}

// ============================================================================
// API Client
// ============================================================================

pub struct OpenWeatherClient {
    client: reqwest::blocking::Client,
    base_url: String,
    api_key: String,
}

impl OpenWeatherClient {
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> Result<Self, DataSourceError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DataSourceError::transport(PROVIDER, e))?;
        Ok(Self {
            client,
            base_url: base_url.to_string(),
            api_key: api_key.to_string(),
        })
    }
}

impl WeatherSource for OpenWeatherClient {
    fn current(&self, location: &Location) -> Result<WeatherObservation, DataSourceError> {
        let response = self
            .client
            .get(&self.base_url)
            .query(&[
                ("lat", location.latitude.to_string()),
                ("lon", location.longitude.to_string()),
                ("appid", self.api_key.clone()),
                ("units", "metric".to_string()),
            ])
            .header("Accept", "application/json")
            .send()
            .map_err(|e| DataSourceError::transport(PROVIDER, e))?;

        if !response.status().is_success() {
            return Err(DataSourceError::Http {
                provider: PROVIDER,
                status: response.status().as_u16(),
            });
        }

        let body = response.text().map_err(|e| DataSourceError::transport(PROVIDER, e))?;
        parse_current(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RAINY: &str = r#"{
        "coord": {"lon": 7.9, "lat": 46.5},
        "weather": [{"id": 501, "main": "Rain", "description": "moderate rain"}],
        "main": {"temp": 6.4, "feels_like": 3.1, "pressure": 1002, "humidity": 93},
        "wind": {"speed": 4.1, "deg": 250},
        "rain": {"1h": 3.2},
        "clouds": {"all": 100},
        "dt": 1714568400,
        "name": "Lauterbrunnen"
    }"#;

    const DRY: &str = r#"{
        "main": {"temp": 18.0, "humidity": 41},
        "dt": 1714568400
    }"#;

    #[test]
    fn test_parse_rainy_observation() {
        let obs = parse_current(RAINY).unwrap();
        assert_eq!(obs.temperature_c, 6.4);
        assert_eq!(obs.humidity_pct, 93.0);
        assert_eq!(obs.rain_1h_mm, 3.2);
        assert_eq!(obs.observed_at.to_rfc3339(), "2024-05-01T13:00:00+00:00");
    }

    #[test]
    fn test_missing_rain_block_is_zero() {
        let obs = parse_current(DRY).unwrap();
        assert_eq!(obs.rain_1h_mm, 0.0);
    }

    #[test]
    fn test_missing_main_block_is_parse_error() {
        let err = parse_current(r#"{"dt": 1714568400}"#).unwrap_err();
        assert!(matches!(err, DataSourceError::Parse { provider: "weather", .. }));
    }

    #[test]
    fn test_garbage_is_parse_error() {
        assert!(parse_current("<html>502 Bad Gateway</html>").is_err());
    }
}
