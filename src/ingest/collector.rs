//! Feature collection: one weather observation in, one stored snapshot out.
//!
//! Accumulated rainfall and temperature change are derived from the site's
//! stored history, assuming one snapshot per collection interval (hourly by
//! default):
//!
//! - `rain_24h_mm` / `rain_72h_mm`: current `rain_1h_mm` plus every stored
//!   `rain_1h_mm` stamped inside the window.
//! - `api_value`: `0.5 · rain_24h + 0.3 · rain_72h`.
//! - `temp_change_6h_c` / `temp_change_24h_c`: current temperature minus the
//!   oldest stored temperature inside the window; 0 when there is none.
//!
//! Seismic features are not collected here; they are aggregated at
//! evaluation time so their decay is measured from the evaluation instant.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use super::{WeatherObservation, WeatherSource};
use crate::error::EvaluationError;
use crate::logging::Source;
use crate::model::{
    API_VALUE, FeatureSnapshot, HUMIDITY, RAIN_1H, RAIN_24H, RAIN_72H, Site, TEMP_CHANGE_6H, TEMP_CHANGE_24H,
    TEMPERATURE,
};
use crate::storage::Storage;

/// Snapshots pulled to cover the longest accumulation window.
const HISTORY_FOR_DERIVATION: usize = 72;

pub struct FeatureCollector {
    storage: Arc<dyn Storage>,
    weather: Box<dyn WeatherSource>,
}

impl FeatureCollector {
    pub fn new(storage: Arc<dyn Storage>, weather: Box<dyn WeatherSource>) -> Self {
        Self { storage, weather }
    }

    /// True when the site has no snapshot or its latest one is older than
    /// `interval`.
    pub fn needs_collection(&self, site_id: &str, interval: Duration, now: DateTime<Utc>) -> Result<bool, EvaluationError> {
        Ok(match self.storage.latest_feature_snapshot(site_id)? {
            Some(latest) => now - latest.timestamp >= interval,
            None => true,
        })
    }

    /// Fetches current weather for `site`, derives the accumulated
    /// features and appends the snapshot stamped `now`.
    pub fn collect_site(&self, site: &Site, now: DateTime<Utc>) -> Result<FeatureSnapshot, EvaluationError> {
        let observation = self
            .weather
            .current(&site.location)
            .map_err(|e| EvaluationError::provider_failed(&site.id, e))?;

        let history = self.storage.recent_feature_history(&site.id, HISTORY_FOR_DERIVATION)?;
        let snapshot = derive_snapshot(&site.id, &observation, &history, now);
        self.storage.append_feature_snapshot(&snapshot)?;

        tracing::debug!(
            source = %Source::Weather,
            site_id = %site.id,
            rain_1h_mm = observation.rain_1h_mm,
            temperature_c = observation.temperature_c,
            "feature snapshot collected"
        );
        Ok(snapshot)
    }
}

/// Builds the snapshot for `observation` taken at `now`, given the stored
/// `history` (oldest first).
pub fn derive_snapshot(
    site_id: &str,
    observation: &WeatherObservation,
    history: &[FeatureSnapshot],
    now: DateTime<Utc>,
) -> FeatureSnapshot {
    let rain_24h = accumulated_rain(observation.rain_1h_mm, history, now - Duration::hours(24));
    let rain_72h = accumulated_rain(observation.rain_1h_mm, history, now - Duration::hours(72));
    let api_value = rain_24h * 0.5 + rain_72h * 0.3;

    FeatureSnapshot::new(site_id, now)
        .with(RAIN_1H, observation.rain_1h_mm)
        .with(RAIN_24H, rain_24h)
        .with(RAIN_72H, rain_72h)
        .with(API_VALUE, api_value)
        .with(TEMPERATURE, observation.temperature_c)
        .with(HUMIDITY, observation.humidity_pct)
        .with(
            TEMP_CHANGE_6H,
            temp_change(observation.temperature_c, history, now - Duration::hours(6)),
        )
        .with(
            TEMP_CHANGE_24H,
            temp_change(observation.temperature_c, history, now - Duration::hours(24)),
        )
}

fn accumulated_rain(current: f64, history: &[FeatureSnapshot], since: DateTime<Utc>) -> f64 {
    current
        + history
            .iter()
            .filter(|s| s.timestamp > since)
            .filter_map(|s| s.get(RAIN_1H))
            .filter(|v| v.is_finite())
            .sum::<f64>()
}

fn temp_change(current: f64, history: &[FeatureSnapshot], since: DateTime<Utc>) -> f64 {
    history
        .iter()
        .filter(|s| s.timestamp >= since)
        .find_map(|s| s.get(TEMPERATURE).filter(|t| t.is_finite()))
        .map(|oldest| current - oldest)
        .unwrap_or(0.0)
}
