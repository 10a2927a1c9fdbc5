//! Seismic feature aggregation.
//!
//! Turns the raw events a seismic provider returned for one site into four
//! scalar features. Recent and nearby events count for more: each event's
//! magnitude is scaled by `1 / (hours_ago + 1)` and `1 / (distance_km + 1)`,
//! so there is no hard cutoff and no division by zero for an event "now" or
//! directly beneath the site.
//!
//! # Clock injection
//! `aggregate` takes `now` rather than calling `Utc::now()`, so the decay is
//! deterministic in tests.

use chrono::{DateTime, Duration, Utc};

use crate::model::{
    FeatureSnapshot, MAX_MAGNITUDE, MINUTES_SINCE_M3, QUAKE_COUNT, SeismicEvent, WEIGHTED_MAGNITUDE,
};

/// Mean Earth radius used for great-circle distances, in kilometres.
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Magnitude at or above which an event counts as significant.
pub const SIGNIFICANT_MAGNITUDE: f64 = 3.0;

// ---------------------------------------------------------------------------
// Distance
// ---------------------------------------------------------------------------

/// Great-circle distance between two WGS84 points, in kilometres (haversine).
pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let (lat1, lon1, lat2, lon2) = (
        lat1.to_radians(),
        lon1.to_radians(),
        lat2.to_radians(),
        lon2.to_radians(),
    );
    let dlat = lat2 - lat1;
    let dlon = lon2 - lon1;

    let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_KM * c
}

// ---------------------------------------------------------------------------
// Features
// ---------------------------------------------------------------------------

/// Aggregated seismic features for one site at one instant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SeismicFeatures {
    pub quake_count: u32,
    pub max_magnitude: f64,
    pub weighted_magnitude: f64,
    /// `f64::INFINITY` when no M3+ event is in the window.
    pub minutes_since_m3: f64,
}

impl SeismicFeatures {
    /// The feature set for "nothing happened": `{0, 0.0, 0.0, +inf}`.
    pub fn baseline() -> Self {
        Self {
            quake_count: 0,
            max_magnitude: 0.0,
            weighted_magnitude: 0.0,
            minutes_since_m3: f64::INFINITY,
        }
    }

    /// Writes the four features onto a snapshot, replacing any stored values.
    pub fn apply_to(&self, snapshot: &mut FeatureSnapshot) {
        snapshot.insert(QUAKE_COUNT, f64::from(self.quake_count));
        snapshot.insert(MAX_MAGNITUDE, self.max_magnitude);
        snapshot.insert(WEIGHTED_MAGNITUDE, self.weighted_magnitude);
        snapshot.insert(MINUTES_SINCE_M3, self.minutes_since_m3);
    }

    /// True when a snapshot already carries all four seismic features.
    pub fn present_on(snapshot: &FeatureSnapshot) -> bool {
        [QUAKE_COUNT, MAX_MAGNITUDE, WEIGHTED_MAGNITUDE, MINUTES_SINCE_M3]
            .iter()
            .all(|key| snapshot.get(key).is_some())
    }
}

/// Converts seismic events within a lookback window into features.
#[derive(Debug, Clone, Copy)]
pub struct SeismicFeatureAggregator {
    lookback: Duration,
}

impl Default for SeismicFeatureAggregator {
    fn default() -> Self {
        Self::new(Duration::hours(72))
    }
}

impl SeismicFeatureAggregator {
    pub fn new(lookback: Duration) -> Self {
        Self { lookback }
    }

    pub fn lookback(&self) -> Duration {
        self.lookback
    }

    /// Aggregates `events` as seen at `now`.
    ///
    /// Never fails. Malformed events (non-finite magnitude or distance,
    /// negative distance) and events older than the lookback are dropped;
    /// events stamped after `now` are treated as happening at `now`. If no
    /// usable event remains, the baseline set is returned.
    pub fn aggregate(&self, events: &[SeismicEvent], now: DateTime<Utc>) -> SeismicFeatures {
        let window_start = now - self.lookback;
        let usable: Vec<&SeismicEvent> = events
            .iter()
            .filter(|e| e.magnitude.is_finite() && e.distance_km.is_finite() && e.distance_km >= 0.0)
            .filter(|e| e.time >= window_start)
            .collect();

        if usable.is_empty() {
            return SeismicFeatures::baseline();
        }

        let max_magnitude = usable
            .iter()
            .map(|e| e.magnitude)
            .fold(f64::NEG_INFINITY, f64::max);

        let minutes_since_m3 = usable
            .iter()
            .filter(|e| e.magnitude >= SIGNIFICANT_MAGNITUDE)
            .map(|e| e.time)
            .max()
            .map(|last| elapsed_seconds(last, now) / 60.0)
            .unwrap_or(f64::INFINITY);

        let weighted_magnitude = usable
            .iter()
            .map(|e| {
                let hours_ago = elapsed_seconds(e.time, now) / 3600.0;
                let time_weight = 1.0 / (hours_ago + 1.0);
                let distance_weight = 1.0 / (e.distance_km + 1.0);
                e.magnitude * time_weight * distance_weight
            })
            .sum();

        SeismicFeatures {
            quake_count: usable.len() as u32,
            max_magnitude,
            weighted_magnitude,
            minutes_since_m3,
        }
    }
}

/// Seconds from `then` to `now`, floored at zero for future-dated events.
fn elapsed_seconds(then: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    let millis = (now - then).num_milliseconds().max(0);
    millis as f64 / 1000.0
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 13, 0, 0).unwrap()
    }

    fn event(minutes_ago: i64, magnitude: f64, distance_km: f64) -> SeismicEvent {
        SeismicEvent {
            time: fixed_now() - Duration::minutes(minutes_ago),
            magnitude,
            distance_km,
        }
    }

    // --- Distance -----------------------------------------------------------

    #[test]
    fn test_haversine_zero_for_same_point() {
        assert_eq!(haversine_km(46.5, 7.9, 46.5, 7.9), 0.0);
    }

    #[test]
    fn test_haversine_one_degree_of_latitude() {
        // One degree along a meridian is R * pi / 180.
        let d = haversine_km(0.0, 0.0, 1.0, 0.0);
        let expected = EARTH_RADIUS_KM * std::f64::consts::PI / 180.0;
        assert!((d - expected).abs() < 1e-9, "got {}", d);
    }

    #[test]
    fn test_haversine_known_city_pair() {
        // Bern to Zurich, about 95 km.
        let d = haversine_km(46.9480, 7.4474, 47.3769, 8.5417);
        assert!((d - 95.5).abs() < 1.0, "got {}", d);
    }

    #[test]
    fn test_haversine_is_symmetric() {
        let ab = haversine_km(40.56, -89.99, 41.11, -89.35);
        let ba = haversine_km(41.11, -89.35, 40.56, -89.99);
        assert_eq!(ab, ba);
    }

    // --- Aggregation --------------------------------------------------------

    #[test]
    fn test_empty_events_yield_baseline() {
        let features = SeismicFeatureAggregator::default().aggregate(&[], fixed_now());
        assert_eq!(features.quake_count, 0);
        assert_eq!(features.max_magnitude, 0.0);
        assert_eq!(features.weighted_magnitude, 0.0);
        assert_eq!(features.minutes_since_m3, f64::INFINITY);
        assert_eq!(features, SeismicFeatures::baseline());
    }

    #[test]
    fn test_event_now_and_on_site_has_full_weight() {
        let features = SeismicFeatureAggregator::default().aggregate(&[event(0, 2.5, 0.0)], fixed_now());
        assert_eq!(features.weighted_magnitude, 2.5);
        assert_eq!(features.quake_count, 1);
        assert_eq!(features.minutes_since_m3, f64::INFINITY, "2.5 is below the M3 cutoff");
    }

    #[test]
    fn test_weighted_magnitude_decays_with_time_and_distance() {
        // 2 hours ago, 9 km away: 4.0 * 1/3 * 1/10
        let features = SeismicFeatureAggregator::default().aggregate(&[event(120, 4.0, 9.0)], fixed_now());
        let expected = 4.0 * (1.0 / 3.0) * (1.0 / 10.0);
        assert!((features.weighted_magnitude - expected).abs() < 1e-12);
    }

    #[test]
    fn test_weighted_magnitude_sums_events() {
        let events = [event(0, 2.0, 0.0), event(60, 3.0, 1.0)];
        let features = SeismicFeatureAggregator::default().aggregate(&events, fixed_now());
        // 2.0 + 3.0 * 1/2 * 1/2
        assert!((features.weighted_magnitude - 2.75).abs() < 1e-12);
        assert_eq!(features.quake_count, 2);
        assert_eq!(features.max_magnitude, 3.0);
    }

    #[test]
    fn test_minutes_since_most_recent_m3() {
        let events = [event(300, 3.4, 20.0), event(45, 3.0, 50.0), event(5, 1.2, 2.0)];
        let features = SeismicFeatureAggregator::default().aggregate(&events, fixed_now());
        assert_eq!(features.minutes_since_m3, 45.0);
        assert_eq!(features.max_magnitude, 3.4);
    }

    #[test]
    fn test_events_outside_lookback_are_ignored() {
        let aggregator = SeismicFeatureAggregator::new(Duration::hours(72));
        let events = [event(73 * 60, 5.0, 1.0)];
        assert_eq!(aggregator.aggregate(&events, fixed_now()), SeismicFeatures::baseline());
    }

    #[test]
    fn test_malformed_events_degrade_to_baseline() {
        let events = [event(10, f64::NAN, 5.0), event(10, 3.5, -1.0), event(10, 2.0, f64::INFINITY)];
        let features = SeismicFeatureAggregator::default().aggregate(&events, fixed_now());
        assert_eq!(features, SeismicFeatures::baseline());
    }

    #[test]
    fn test_malformed_events_dropped_but_good_ones_kept() {
        let events = [event(10, f64::NAN, 5.0), event(0, 1.5, 0.0)];
        let features = SeismicFeatureAggregator::default().aggregate(&events, fixed_now());
        assert_eq!(features.quake_count, 1);
        assert_eq!(features.weighted_magnitude, 1.5);
    }

    #[test]
    fn test_future_dated_event_counts_as_now() {
        let events = [event(-10, 3.2, 0.0)];
        let features = SeismicFeatureAggregator::default().aggregate(&events, fixed_now());
        assert_eq!(features.minutes_since_m3, 0.0);
        assert_eq!(features.weighted_magnitude, 3.2);
    }

    #[test]
    fn test_apply_to_snapshot() {
        let mut snapshot = FeatureSnapshot::new("site-a", fixed_now());
        assert!(!SeismicFeatures::present_on(&snapshot));
        SeismicFeatures::baseline().apply_to(&mut snapshot);
        assert!(SeismicFeatures::present_on(&snapshot));
        assert_eq!(snapshot.get(MINUTES_SINCE_M3), Some(f64::INFINITY));
        assert_eq!(snapshot.get(QUAKE_COUNT), Some(0.0));
    }
}
