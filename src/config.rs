//! Service configuration.
//!
//! One immutable `Settings` value is built at process start (TOML file plus
//! environment secrets) and passed by reference into each component. Every
//! section has defaults, so an empty file is a valid configuration.

use std::path::Path;
use std::time::Duration as StdDuration;

use chrono::Duration;
use serde::Deserialize;

use crate::error::ConfigError;
use crate::model::RiskTier;

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// Which scoring strategy the classifier uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    RuleBased,
    /// Use the model artifact at `model_path`, falling back to rules if it
    /// cannot be loaded.
    Model,
}

/// Thresholds of the rule-based scorer. Each rule contributes its factor
/// when it fires; the probability is the largest fired factor.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RuleSet {
    pub rain_24h_mm: f64,
    pub rain_24h_factor: f64,
    pub rain_72h_mm: f64,
    pub rain_72h_factor: f64,
    pub magnitude: f64,
    pub magnitude_factor: f64,
    pub humidity_pct: f64,
    pub humidity_factor: f64,
    /// Probability reported when no rule fires.
    pub baseline: f64,
}

impl Default for RuleSet {
    fn default() -> Self {
        Self {
            rain_24h_mm: 25.0,
            rain_24h_factor: 0.6,
            rain_72h_mm: 50.0,
            rain_72h_factor: 0.8,
            magnitude: 3.0,
            magnitude_factor: 0.7,
            humidity_pct: 85.0,
            humidity_factor: 0.4,
            baseline: 0.1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    pub strategy: Strategy,
    pub model_path: Option<String>,
    /// Probability at or above which a site is HIGH risk.
    pub high_threshold: f64,
    /// Probability at or above which a site is MEDIUM risk.
    pub medium_threshold: f64,
    pub rules: RuleSet,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::RuleBased,
            model_path: None,
            high_threshold: 0.6,
            medium_threshold: 0.4,
            rules: RuleSet::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    pub medium_window_minutes: i64,
    /// Shorter than the MEDIUM window so escalating risk is re-announced sooner.
    pub high_window_minutes: i64,
    /// Whether a PARTIAL delivery counts as "recently alerted".
    pub count_partial: bool,
    /// How long a PENDING record holds its window. Older PENDING records are
    /// orphans of a dead evaluation and block nothing.
    pub pending_in_flight_minutes: i64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            medium_window_minutes: 60,
            high_window_minutes: 15,
            count_partial: true,
            pending_in_flight_minutes: 2,
        }
    }
}

impl ThrottleConfig {
    pub fn pending_in_flight(&self) -> Duration {
        Duration::minutes(self.pending_in_flight_minutes)
    }

    /// Throttle window for a tier; `None` for LOW, which never alerts.
    pub fn window(&self, tier: RiskTier) -> Option<Duration> {
        match tier {
            RiskTier::Low => None,
            RiskTier::Medium => Some(Duration::minutes(self.medium_window_minutes)),
            RiskTier::High => Some(Duration::minutes(self.high_window_minutes)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    /// Number of snapshots pulled for rolling statistics.
    pub history_limit: usize,
    /// Rolling window sizes, in samples (hourly sampling assumed).
    pub rolling_windows: Vec<usize>,
    pub seismic_lookback_hours: i64,
    /// Search radius for seismic events around a site.
    pub seismic_radius_km: f64,
    pub seismic_min_magnitude: f64,
    /// Snapshots older than this are refused as stale.
    pub max_snapshot_age_minutes: i64,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            history_limit: 72,
            rolling_windows: vec![6, 12, 24],
            seismic_lookback_hours: 72,
            seismic_radius_km: 100.0,
            seismic_min_magnitude: 1.0,
            max_snapshot_age_minutes: 180,
        }
    }
}

impl FeatureConfig {
    pub fn seismic_lookback(&self) -> Duration {
        Duration::hours(self.seismic_lookback_hours)
    }

    pub fn max_snapshot_age(&self) -> Duration {
        Duration::minutes(self.max_snapshot_age_minutes)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub interval_secs: u64,
    /// Maximum number of sites evaluated at once.
    pub worker_limit: usize,
    /// Timeout applied to every storage, data-source and channel call.
    pub call_timeout_secs: u64,
    /// PENDING alerts older than this are resolved to ERROR by the sweep.
    pub pending_alert_max_age_minutes: i64,
    /// A site is re-collected when its latest snapshot is older than this.
    pub collection_interval_minutes: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            worker_limit: 4,
            call_timeout_secs: 5,
            pending_alert_max_age_minutes: 5,
            collection_interval_minutes: 60,
        }
    }
}

impl SchedulerConfig {
    pub fn interval(&self) -> StdDuration {
        StdDuration::from_secs(self.interval_secs)
    }

    pub fn call_timeout(&self) -> StdDuration {
        StdDuration::from_secs(self.call_timeout_secs)
    }

    pub fn pending_alert_max_age(&self) -> Duration {
        Duration::minutes(self.pending_alert_max_age_minutes)
    }

    pub fn collection_interval(&self) -> Duration {
        Duration::minutes(self.collection_interval_minutes)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct EmailConfig {
    /// HTTP endpoint of the transactional mail API.
    pub endpoint: String,
    pub from: String,
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.mail.example.com/v1/send".to_string(),
            from: "alerts@rockfall.local".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SmsConfig {
    pub api_base: String,
    pub from_number: String,
}

impl Default for SmsConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.twilio.com".to_string(),
            from_number: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ChannelsConfig {
    pub email: Option<EmailConfig>,
    pub sms: Option<SmsConfig>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SourcesConfig {
    pub weather_url: String,
    pub seismic_url: String,
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            weather_url: "https://api.openweathermap.org/data/2.5/weather".to_string(),
            seismic_url: "https://earthquake.usgs.gov/fdsnws/event/1/query".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is not set.
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Complete service configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub classifier: ClassifierConfig,
    pub throttle: ThrottleConfig,
    pub features: FeatureConfig,
    pub scheduler: SchedulerConfig,
    pub channels: ChannelsConfig,
    pub sources: SourcesConfig,
    pub logging: LoggingConfig,
}

impl Settings {
    /// Parses and validates a TOML document.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let settings: Settings = toml::from_str(contents)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reads, parses and validates a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    /// Rejects configurations that would make the pipeline misbehave.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let c = &self.classifier;
        for (name, value) in [("high_threshold", c.high_threshold), ("medium_threshold", c.medium_threshold)] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::Invalid(format!(
                    "classifier.{} must be within [0, 1], got {}",
                    name, value
                )));
            }
        }
        if c.medium_threshold > c.high_threshold {
            return Err(ConfigError::Invalid(format!(
                "classifier.medium_threshold ({}) must not exceed high_threshold ({})",
                c.medium_threshold, c.high_threshold
            )));
        }
        if c.strategy == Strategy::Model && c.model_path.is_none() {
            return Err(ConfigError::Invalid(
                "classifier.model_path is required when strategy = \"model\"".to_string(),
            ));
        }
        let r = &c.rules;
        for factor in [r.rain_24h_factor, r.rain_72h_factor, r.magnitude_factor, r.humidity_factor, r.baseline] {
            if !(0.0..=1.0).contains(&factor) {
                return Err(ConfigError::Invalid(format!(
                    "classifier.rules factors must be within [0, 1], got {}",
                    factor
                )));
            }
        }
        if self.throttle.medium_window_minutes < 0 || self.throttle.high_window_minutes < 0 {
            return Err(ConfigError::Invalid("throttle windows must not be negative".to_string()));
        }
        let t = &self.throttle;
        if t.pending_in_flight_minutes <= 0
            || t.pending_in_flight_minutes >= t.high_window_minutes.min(t.medium_window_minutes)
        {
            return Err(ConfigError::Invalid(format!(
                "throttle.pending_in_flight_minutes must be positive and shorter than every window, got {}",
                t.pending_in_flight_minutes
            )));
        }
        if self.features.rolling_windows.is_empty() || self.features.rolling_windows.contains(&0) {
            return Err(ConfigError::Invalid(
                "features.rolling_windows must be non-empty and positive".to_string(),
            ));
        }
        if self.features.history_limit == 0 {
            return Err(ConfigError::Invalid("features.history_limit must be positive".to_string()));
        }
        let s = &self.scheduler;
        if s.interval_secs == 0 || s.worker_limit == 0 || s.call_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "scheduler interval, worker_limit and call_timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Secrets
// ---------------------------------------------------------------------------

/// Credentials read from the environment (after `.env` is loaded).
#[derive(Clone, Default)]
pub struct Secrets {
    pub database_url: Option<String>,
    pub email_api_key: Option<String>,
    pub twilio_account_sid: Option<String>,
    pub twilio_auth_token: Option<String>,
    pub weather_api_key: Option<String>,
}

impl Secrets {
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());
        Self {
            database_url: var("DATABASE_URL"),
            email_api_key: var("EMAIL_API_KEY"),
            twilio_account_sid: var("TWILIO_ACCOUNT_SID"),
            twilio_auth_token: var("TWILIO_AUTH_TOKEN"),
            weather_api_key: var("OWM_API_KEY"),
        }
    }

    pub fn require_database_url(&self) -> Result<&str, ConfigError> {
        self.database_url
            .as_deref()
            .ok_or(ConfigError::MissingEnv("DATABASE_URL"))
    }
}

impl std::fmt::Debug for Secrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shown = |v: &Option<String>| if v.is_some() { "<set>" } else { "<unset>" };
        f.debug_struct("Secrets")
            .field("database_url", &shown(&self.database_url))
            .field("email_api_key", &shown(&self.email_api_key))
            .field("twilio_account_sid", &shown(&self.twilio_account_sid))
            .field("twilio_auth_token", &shown(&self.twilio_auth_token))
            .field("weather_api_key", &shown(&self.weather_api_key))
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
