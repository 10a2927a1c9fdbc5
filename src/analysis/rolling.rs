//! Rolling statistics over a site's recent snapshots.
//!
//! The engine takes the trailing history for one site (oldest first, as
//! storage returns it) and produces a copy of the latest snapshot carrying
//! temporal, interaction and per-window features on top of the stored ones.
//! Windows are counted in samples, not hours; with hourly collection the two
//! coincide.
//!
//! Short history never fails: a window simply covers `min(w, n)` samples, and
//! a statistic with too few samples is left out rather than guessed.

use std::f64::consts::PI;

use chrono::{Datelike, Timelike};

use crate::model::{FeatureSnapshot, HUMIDITY, RAIN_1H, RAIN_72H, TEMPERATURE, WEIGHTED_MAGNITUDE};

pub const MONTH: &str = "month";
pub const DAY_SIN: &str = "day_sin";
pub const DAY_COS: &str = "day_cos";
pub const RAIN_INTENSITY: &str = "rain_intensity";
pub const TEMP_HUMIDITY_INDEX: &str = "temp_humidity_index";
pub const SEISMIC_RAIN_INTERACTION: &str = "seismic_rain_interaction";

/// Key of a per-window statistic, e.g. `window_key("temp_mean", 6)` is
/// `temp_mean_6h`.
pub fn window_key(stat: &str, window: usize) -> String {
    format!("{}_{}h", stat, window)
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollingFeatureEngine {
    windows: Vec<usize>,
}

impl Default for RollingFeatureEngine {
    fn default() -> Self {
        Self::new(vec![6, 12, 24])
    }
}

impl RollingFeatureEngine {
    /// Zero-sized windows are ignored.
    pub fn new(windows: Vec<usize>) -> Self {
        let windows = windows.into_iter().filter(|w| *w > 0).collect();
        Self { windows }
    }

    pub fn windows(&self) -> &[usize] {
        &self.windows
    }

    /// Enriches the last snapshot of `history`.
    ///
    /// Returns `None` only when `history` is empty. The input is not
    /// modified.
    pub fn enrich(&self, history: &[FeatureSnapshot]) -> Option<FeatureSnapshot> {
        let latest = history.last()?;
        let mut enriched = latest.clone();

        add_temporal(&mut enriched);
        add_interactions(&mut enriched);

        for &w in &self.windows {
            let start = history.len().saturating_sub(w);
            let trailing = &history[start..];

            let temps = column(trailing, TEMPERATURE);
            let humidity = column(trailing, HUMIDITY);
            let rain = column(trailing, RAIN_1H);

            if let Some(m) = mean(&temps) {
                enriched.insert(window_key("temp_mean", w), m);
            }
            if let Some(m) = mean(&humidity) {
                enriched.insert(window_key("humidity_mean", w), m);
            }
            if let Some(s) = sample_std(&temps) {
                enriched.insert(window_key("temp_std", w), s);
            }
            if let Some(s) = sample_std(&rain) {
                enriched.insert(window_key("rain_std", w), s);
            }
            if let Some(m) = rain.iter().copied().reduce(f64::max) {
                enriched.insert(window_key("rain_max", w), m);
            }
        }

        Some(enriched)
    }
}

fn add_temporal(snapshot: &mut FeatureSnapshot) {
    let hour = f64::from(snapshot.timestamp.hour());
    let angle = 2.0 * PI * hour / 24.0;
    snapshot.insert(MONTH, f64::from(snapshot.timestamp.month()));
    snapshot.insert(DAY_SIN, angle.sin());
    snapshot.insert(DAY_COS, angle.cos());
}

fn add_interactions(snapshot: &mut FeatureSnapshot) {
    if let Some(rain) = snapshot.get(RAIN_1H) {
        snapshot.insert(RAIN_INTENSITY, rain);
    }
    if let (Some(t), Some(h)) = (snapshot.get(TEMPERATURE), snapshot.get(HUMIDITY)) {
        snapshot.insert(TEMP_HUMIDITY_INDEX, t * h / 100.0);
    }
    if let (Some(m), Some(r)) = (snapshot.get(WEIGHTED_MAGNITUDE), snapshot.get(RAIN_72H)) {
        snapshot.insert(SEISMIC_RAIN_INTERACTION, m * r);
    }
}

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

/// Z-scores `keys` across `history` and returns normalized copies.
///
/// Each key uses the sample mean and sample standard deviation of its
/// finite values in `history`. A key whose deviation is zero or undefined
/// (fewer than two values) is left unscaled, as are non-finite values.
pub fn normalize(history: &[FeatureSnapshot], keys: &[&str]) -> Vec<FeatureSnapshot> {
    let mut normalized = history.to_vec();

    for key in keys {
        let values = column(history, key);
        let (Some(m), Some(s)) = (mean(&values), sample_std(&values)) else {
            continue;
        };
        if s == 0.0 || !s.is_finite() {
            continue;
        }
        for snapshot in normalized.iter_mut() {
            if let Some(v) = snapshot.get(key).filter(|v| v.is_finite()) {
                snapshot.insert(*key, (v - m) / s);
            }
        }
    }

    normalized
}

// ---------------------------------------------------------------------------
// Statistics helpers
// ---------------------------------------------------------------------------

/// Finite values of `key` across `snapshots`, oldest first.
fn column(snapshots: &[FeatureSnapshot], key: &str) -> Vec<f64> {
    snapshots
        .iter()
        .filter_map(|s| s.get(key))
        .filter(|v| v.is_finite())
        .collect()
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Sample (n - 1) standard deviation; `None` below two samples.
fn sample_std(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let m = mean(values)?;
    let var = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    Some(var.sqrt())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap()
    }

    /// Hourly snapshots with the given temperatures and a fixed rain pattern.
    fn hourly(temps: &[f64]) -> Vec<FeatureSnapshot> {
        temps
            .iter()
            .enumerate()
            .map(|(i, t)| {
                FeatureSnapshot::new("site-a", start() + Duration::hours(i as i64))
                    .with(TEMPERATURE, *t)
                    .with(HUMIDITY, 80.0)
                    .with(RAIN_1H, i as f64)
            })
            .collect()
    }

    #[test]
    fn test_empty_history_yields_none() {
        assert!(RollingFeatureEngine::default().enrich(&[]).is_none());
    }

    #[test]
    fn test_single_sample_has_means_but_no_std() {
        let history = hourly(&[10.0]);
        let enriched = RollingFeatureEngine::default().enrich(&history).unwrap();

        assert_eq!(enriched.get("temp_mean_6h"), Some(10.0));
        assert_eq!(enriched.get("humidity_mean_24h"), Some(80.0));
        assert_eq!(enriched.get("rain_max_12h"), Some(0.0));
        assert_eq!(enriched.get("temp_std_6h"), None);
        assert_eq!(enriched.get("rain_std_6h"), None);
    }

    #[test]
    fn test_window_uses_trailing_samples_only() {
        // 8 samples; the 6-sample window sees temps 3..=8.
        let history = hourly(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]);
        let enriched = RollingFeatureEngine::new(vec![6]).enrich(&history).unwrap();

        assert_eq!(enriched.get("temp_mean_6h"), Some(5.5));
        assert_eq!(enriched.get("rain_max_6h"), Some(7.0));
        // Sample std of 3..=8 is sqrt(3.5).
        let std = enriched.get("temp_std_6h").unwrap();
        assert!((std - 3.5_f64.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn test_window_longer_than_history_covers_everything() {
        let history = hourly(&[2.0, 4.0]);
        let enriched = RollingFeatureEngine::new(vec![24]).enrich(&history).unwrap();
        assert_eq!(enriched.get("temp_mean_24h"), Some(3.0));
        assert!((enriched.get("temp_std_24h").unwrap() - 2.0_f64.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn test_temporal_features_from_latest_timestamp() {
        // Latest sample at 06:00 -> quarter turn.
        let history = hourly(&[0.0; 7]);
        let enriched = RollingFeatureEngine::default().enrich(&history).unwrap();
        assert_eq!(enriched.get(MONTH), Some(5.0));
        assert!((enriched.get(DAY_SIN).unwrap() - 1.0).abs() < 1e-12);
        assert!(enriched.get(DAY_COS).unwrap().abs() < 1e-12);
    }

    #[test]
    fn test_interaction_features() {
        let snapshot = FeatureSnapshot::new("site-a", start())
            .with(RAIN_1H, 4.0)
            .with(RAIN_72H, 60.0)
            .with(TEMPERATURE, 20.0)
            .with(HUMIDITY, 50.0)
            .with(WEIGHTED_MAGNITUDE, 0.5);
        let enriched = RollingFeatureEngine::default().enrich(&[snapshot]).unwrap();

        assert_eq!(enriched.get(RAIN_INTENSITY), Some(4.0));
        assert_eq!(enriched.get(TEMP_HUMIDITY_INDEX), Some(10.0));
        assert_eq!(enriched.get(SEISMIC_RAIN_INTERACTION), Some(30.0));
    }

    #[test]
    fn test_interaction_skipped_when_input_missing() {
        let snapshot = FeatureSnapshot::new("site-a", start()).with(TEMPERATURE, 20.0);
        let enriched = RollingFeatureEngine::default().enrich(&[snapshot]).unwrap();
        assert_eq!(enriched.get(TEMP_HUMIDITY_INDEX), None);
        assert_eq!(enriched.get(SEISMIC_RAIN_INTERACTION), None);
    }

    #[test]
    fn test_enrich_keeps_stored_features_and_input_untouched() {
        let history = hourly(&[1.0, 2.0]);
        let before = history.clone();
        let enriched = RollingFeatureEngine::default().enrich(&history).unwrap();
        assert_eq!(enriched.get(TEMPERATURE), Some(2.0));
        assert_eq!(enriched.timestamp, history[1].timestamp);
        assert_eq!(history, before);
    }

    #[test]
    fn test_zero_windows_are_dropped() {
        assert_eq!(RollingFeatureEngine::new(vec![0, 6]).windows(), &[6]);
    }

    // --- Normalization ------------------------------------------------------

    #[test]
    fn test_normalize_z_scores_with_sample_std() {
        let history = hourly(&[1.0, 2.0, 3.0]);
        let normalized = normalize(&history, &[TEMPERATURE]);
        // mean 2, sample std 1
        let z: Vec<f64> = normalized.iter().map(|s| s.get(TEMPERATURE).unwrap()).collect();
        assert_eq!(z, vec![-1.0, 0.0, 1.0]);
    }

    #[test]
    fn test_normalize_leaves_constant_feature_unscaled() {
        let history = hourly(&[5.0, 5.0, 5.0]);
        let normalized = normalize(&history, &[TEMPERATURE, HUMIDITY]);
        assert!(normalized.iter().all(|s| s.get(TEMPERATURE) == Some(5.0)));
        assert!(normalized.iter().all(|s| s.get(HUMIDITY) == Some(80.0)));
    }

    #[test]
    fn test_normalize_single_sample_is_unscaled() {
        let history = hourly(&[7.0]);
        assert_eq!(normalize(&history, &[TEMPERATURE]), history);
    }

    #[test]
    fn test_normalize_ignores_keys_not_listed() {
        let history = hourly(&[1.0, 2.0, 3.0]);
        let normalized = normalize(&history, &[TEMPERATURE]);
        assert_eq!(normalized[2].get(RAIN_1H), Some(2.0));
    }
}
