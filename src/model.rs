//! Core data types for the rockfall risk service.
//!
//! This module defines the shared domain model imported by all other modules:
//! sites, feature snapshots, seismic events, risk assessments and alert
//! records. It holds no I/O; the only logic here is small invariant-keeping
//! helpers on the types themselves.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StorageError;

// ---------------------------------------------------------------------------
// Feature keys
// ---------------------------------------------------------------------------

/// Rainfall over the last hour, in millimetres.
pub const RAIN_1H: &str = "rain_1h_mm";
/// Accumulated rainfall over the last 24 hours, in millimetres.
pub const RAIN_24H: &str = "rain_24h_mm";
/// Accumulated rainfall over the last 72 hours, in millimetres.
pub const RAIN_72H: &str = "rain_72h_mm";
/// Antecedent precipitation index.
pub const API_VALUE: &str = "api_value";
pub const TEMPERATURE: &str = "temperature_c";
pub const TEMP_CHANGE_6H: &str = "temp_change_6h_c";
pub const TEMP_CHANGE_24H: &str = "temp_change_24h_c";
/// Relative humidity, in percent.
pub const HUMIDITY: &str = "humidity_pct";
pub const QUAKE_COUNT: &str = "quake_count_72h";
pub const MAX_MAGNITUDE: &str = "max_magnitude_72h";
pub const WEIGHTED_MAGNITUDE: &str = "weighted_magnitude_72h";
/// Minutes since the last M3+ event; `+inf` when there was none.
pub const MINUTES_SINCE_M3: &str = "minutes_since_m3";

/// The raw (non-derived) feature columns, in the order models expect them.
pub const BASE_FEATURES: &[&str] = &[
    RAIN_1H,
    RAIN_24H,
    RAIN_72H,
    API_VALUE,
    TEMPERATURE,
    TEMP_CHANGE_6H,
    TEMP_CHANGE_24H,
    HUMIDITY,
    QUAKE_COUNT,
    MAX_MAGNITUDE,
    WEIGHTED_MAGNITUDE,
    MINUTES_SINCE_M3,
];

/// Named numeric features. Ordered so that stored snapshots serialize
/// identically every time.
pub type FeatureMap = BTreeMap<String, f64>;

// ---------------------------------------------------------------------------
// Sites
// ---------------------------------------------------------------------------

/// WGS84 position of a monitoring site.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
    /// Elevation above sea level in metres, if surveyed.
    #[serde(default)]
    pub elevation_m: Option<f64>,
}

/// Who gets told when a site's risk rises.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contacts {
    #[serde(default)]
    pub emails: Vec<String>,
    #[serde(default)]
    pub phones: Vec<String>,
}

impl Contacts {
    /// Recipients configured for one channel, blank entries skipped.
    pub fn recipients(&self, channel: Channel) -> Vec<&str> {
        let list = match channel {
            Channel::Email => &self.emails,
            Channel::Sms => &self.phones,
        };
        list.iter()
            .map(|r| r.trim())
            .filter(|r| !r.is_empty())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        Channel::ALL
            .iter()
            .all(|channel| self.recipients(*channel).is_empty())
    }
}

/// A monitored slope, cutting or cliff face.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Site {
    pub id: String,
    pub name: String,
    pub location: Location,
    #[serde(default = "default_active")]
    pub is_active: bool,
    #[serde(default)]
    pub contacts: Contacts,
}

fn default_active() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Readings
// ---------------------------------------------------------------------------

/// One timestamped bundle of raw and derived numeric signals for a site.
///
/// Snapshots are append-only: once stored they are never mutated. Derived
/// features are added to a copy by `analysis::rolling`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureSnapshot {
    pub site_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(with = "feature_values")]
    pub features: FeatureMap,
}

impl FeatureSnapshot {
    pub fn new(site_id: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            site_id: site_id.into(),
            timestamp,
            features: FeatureMap::new(),
        }
    }

    /// Builder-style insert, handy for fixtures and collectors.
    pub fn with(mut self, key: &str, value: f64) -> Self {
        self.features.insert(key.to_string(), value);
        self
    }

    pub fn get(&self, key: &str) -> Option<f64> {
        self.features.get(key).copied()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: f64) {
        self.features.insert(key.into(), value);
    }
}

/// A single earthquake as seen from one site.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SeismicEvent {
    pub time: DateTime<Utc>,
    pub magnitude: f64,
    /// Great-circle distance from the site, in kilometres.
    pub distance_km: f64,
}

// ---------------------------------------------------------------------------
// Risk
// ---------------------------------------------------------------------------

/// Discrete risk classification, in ascending order of severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskTier {
    Low,
    Medium,
    High,
}

impl RiskTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskTier::Low => "LOW",
            RiskTier::Medium => "MEDIUM",
            RiskTier::High => "HIGH",
        }
    }
}

impl fmt::Display for RiskTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RiskTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "LOW" => Ok(RiskTier::Low),
            "MEDIUM" => Ok(RiskTier::Medium),
            "HIGH" => Ok(RiskTier::High),
            other => Err(format!("unknown risk tier '{}'", other)),
        }
    }
}

/// The outcome of one evaluation of one site. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub id: Uuid,
    pub site_id: String,
    pub timestamp: DateTime<Utc>,
    pub probability: f64,
    pub tier: RiskTier,
    /// `rule-based`, or the version string of the scoring model used.
    pub scorer: String,
    /// The exact features the classifier saw, for audit and replay.
    #[serde(with = "feature_values")]
    pub features: FeatureMap,
    pub inference_ms: f64,
}

/// Inclusive time bounds for history queries; either end may be open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeRange {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl TimeRange {
    pub fn between(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            start: Some(start),
            end: Some(end),
        }
    }

    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        self.start.is_none_or(|s| t >= s) && self.end.is_none_or(|e| t <= e)
    }
}

/// Aggregate figures over a site's assessments in a range.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AssessmentStats {
    pub total: usize,
    pub average_probability: f64,
    pub high_count: usize,
}

impl AssessmentStats {
    pub fn from_assessments(assessments: &[RiskAssessment]) -> Self {
        let total = assessments.len();
        let average_probability = if total == 0 {
            0.0
        } else {
            assessments.iter().map(|a| a.probability).sum::<f64>() / total as f64
        };
        let high_count = assessments
            .iter()
            .filter(|a| a.tier == RiskTier::High)
            .count();
        Self {
            total,
            average_probability,
            high_count,
        }
    }
}

// ---------------------------------------------------------------------------
// Alerts
// ---------------------------------------------------------------------------

/// Notification channels an alert can go out on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Email,
    Sms,
}

impl Channel {
    pub const ALL: [Channel; 2] = [Channel::Email, Channel::Sms];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Email => "email",
            Channel::Sms => "sms",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "email" => Ok(Channel::Email),
            "sms" => Ok(Channel::Sms),
            other => Err(format!("unknown channel '{}'", other)),
        }
    }
}

/// Lifecycle of an alert record: PENDING, then exactly one terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AlertStatus {
    Pending,
    /// Every attempted channel-recipient pair succeeded.
    Sent,
    /// A non-empty strict subset succeeded.
    Partial,
    /// Nothing succeeded, or a precondition failed before any send.
    Error,
}

impl AlertStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertStatus::Pending => "PENDING",
            AlertStatus::Sent => "SENT",
            AlertStatus::Partial => "PARTIAL",
            AlertStatus::Error => "ERROR",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, AlertStatus::Pending)
    }
}

impl fmt::Display for AlertStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlertStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(AlertStatus::Pending),
            "SENT" => Ok(AlertStatus::Sent),
            "PARTIAL" => Ok(AlertStatus::Partial),
            "ERROR" => Ok(AlertStatus::Error),
            other => Err(format!("unknown alert status '{}'", other)),
        }
    }
}

/// Result of one send to one recipient on one channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    pub channel: Channel,
    pub recipient: String,
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
}

/// The terminal facts written onto a PENDING alert record.
#[derive(Debug, Clone, PartialEq)]
pub struct AlertResolution {
    pub status: AlertStatus,
    pub channels: Vec<Channel>,
    pub deliveries: Vec<DeliveryAttempt>,
    pub error_message: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
}

impl AlertResolution {
    /// An ERROR resolution for a record that never reached a send attempt.
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: AlertStatus::Error,
            channels: Vec::new(),
            deliveries: Vec::new(),
            error_message: Some(message.into()),
            sent_at: None,
        }
    }
}

/// One alert for one assessment. Used by the throttle as the history of
/// "was a {site, tier} alert recently delivered".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRecord {
    pub id: Uuid,
    pub assessment_id: Uuid,
    pub site_id: String,
    pub tier: RiskTier,
    pub status: AlertStatus,
    pub channels: Vec<Channel>,
    pub deliveries: Vec<DeliveryAttempt>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
}

impl AlertRecord {
    pub fn pending(assessment_id: Uuid, site_id: &str, tier: RiskTier, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            assessment_id,
            site_id: site_id.to_string(),
            tier,
            status: AlertStatus::Pending,
            channels: Vec::new(),
            deliveries: Vec::new(),
            error_message: None,
            created_at: now,
            sent_at: None,
        }
    }

    /// Moves a PENDING record to its terminal state. A record is resolved
    /// exactly once; resolving a terminal record is an error.
    pub fn resolve(&mut self, resolution: &AlertResolution) -> Result<(), StorageError> {
        if self.status.is_terminal() {
            return Err(StorageError::AlertAlreadyResolved {
                id: self.id,
                status: self.status,
            });
        }
        if !resolution.status.is_terminal() {
            return Err(StorageError::Corrupt(format!(
                "alert {} cannot be resolved to {}",
                self.id, resolution.status
            )));
        }
        self.status = resolution.status;
        self.channels = resolution.channels.clone();
        self.deliveries = resolution.deliveries.clone();
        self.error_message = resolution.error_message.clone();
        self.sent_at = resolution.sent_at;
        Ok(())
    }

    /// Channels with at least one failed attempt.
    pub fn failed_channels(&self) -> Vec<Channel> {
        let mut failed: Vec<Channel> = self
            .deliveries
            .iter()
            .filter(|d| !d.success)
            .map(|d| d.channel)
            .collect();
        failed.sort();
        failed.dedup();
        failed
    }

    /// Per-channel success flag: a channel succeeded when every recipient did.
    pub fn channel_success(&self) -> BTreeMap<Channel, bool> {
        let mut flags = BTreeMap::new();
        for d in &self.deliveries {
            let entry = flags.entry(d.channel).or_insert(true);
            *entry = *entry && d.success;
        }
        flags
    }
}

// ---------------------------------------------------------------------------
// Feature map serialization
// ---------------------------------------------------------------------------

/// Serde adapter for feature maps that keeps non-finite values.
///
/// JSON has no infinity, and `minutes_since_m3` is `+inf` whenever no M3+
/// event was seen. Finite values are written as numbers; `inf`, `-inf` and
/// `NaN` are written as the strings `"Infinity"`, `"-Infinity"`, `"NaN"`.
pub mod feature_values {
    use std::collections::BTreeMap;

    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use super::FeatureMap;

    #[derive(Serialize, Deserialize)]
    #[serde(untagged)]
    enum Encoded {
        Number(f64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(map: &FeatureMap, serializer: S) -> Result<S::Ok, S::Error> {
        let encoded: BTreeMap<&str, Encoded> = map
            .iter()
            .map(|(k, v)| (k.as_str(), encode(*v)))
            .collect();
        encoded.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<FeatureMap, D::Error> {
        let encoded = BTreeMap::<String, Encoded>::deserialize(deserializer)?;
        encoded
            .into_iter()
            .map(|(k, v)| match v {
                Encoded::Number(n) => Ok((k, n)),
                Encoded::Text(text) => decode(&text)
                    .map(|n| (k.clone(), n))
                    .ok_or_else(|| D::Error::custom(format!("feature '{}' has non-numeric value '{}'", k, text))),
            })
            .collect()
    }

    fn encode(v: f64) -> Encoded {
        if v.is_finite() {
            Encoded::Number(v)
        } else if v.is_nan() {
            Encoded::Text("NaN".to_string())
        } else if v > 0.0 {
            Encoded::Text("Infinity".to_string())
        } else {
            Encoded::Text("-Infinity".to_string())
        }
    }

    fn decode(text: &str) -> Option<f64> {
        match text {
            "Infinity" => Some(f64::INFINITY),
            "-Infinity" => Some(f64::NEG_INFINITY),
            "NaN" => Some(f64::NAN),
            _ => None,
        }
    }

    /// Converts a feature map to a JSON value, for JSONB columns.
    pub fn to_json(map: &FeatureMap) -> serde_json::Value {
        serde_json::Value::Object(
            map.iter()
                .map(|(k, v)| {
                    let value = match encode(*v) {
                        Encoded::Number(n) => serde_json::json!(n),
                        Encoded::Text(t) => serde_json::Value::String(t),
                    };
                    (k.clone(), value)
                })
                .collect(),
        )
    }

    /// Inverse of [`to_json`].
    pub fn from_json(value: serde_json::Value) -> Result<FeatureMap, serde_json::Error> {
        deserialize(value)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
