//! Error types for every boundary of the evaluation pipeline.
//!
//! Collaborator errors (storage, data sources, channels, configuration) are
//! kept separate from `EvaluationError`, which is what a per-site evaluation
//! reports to the scheduler or to an on-demand caller.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::model::{AlertStatus, Channel};

/// Errors raised by a storage collaborator.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] postgres::Error),

    #[error("snapshot for site {site_id} at {timestamp} precedes the latest stored snapshot at {latest}")]
    OutOfOrderSnapshot {
        site_id: String,
        timestamp: DateTime<Utc>,
        latest: DateTime<Utc>,
    },

    #[error("alert record {0} not found")]
    AlertNotFound(Uuid),

    #[error("alert record {id} is already resolved as {status}")]
    AlertAlreadyResolved { id: Uuid, status: AlertStatus },

    #[error("corrupt stored data: {0}")]
    Corrupt(String),
}

/// Errors from weather and seismic providers. Callers collapse all of them
/// into a single `DataUnavailable` condition.
#[derive(Debug, thiserror::Error)]
pub enum DataSourceError {
    #[error("{provider} returned HTTP {status}")]
    Http { provider: &'static str, status: u16 },

    #[error("{provider} request failed: {reason}")]
    Transport { provider: &'static str, reason: String },

    #[error("{provider} response could not be parsed: {reason}")]
    Parse { provider: &'static str, reason: String },
}

impl DataSourceError {
    pub fn transport(provider: &'static str, err: reqwest::Error) -> Self {
        let reason = if err.is_timeout() {
            format!("timed out: {}", err)
        } else {
            err.to_string()
        };
        DataSourceError::Transport { provider, reason }
    }
}

/// Errors raised while turning features into a probability.
#[derive(Debug, thiserror::Error)]
pub enum ClassifierError {
    #[error("required features unavailable: {}", missing.join(", "))]
    FeaturesUnavailable { missing: Vec<String> },

    #[error("model {version} failed to score: {reason}")]
    Model { version: String, reason: String },

    #[error("model artifact {path} could not be loaded: {reason}")]
    Artifact { path: String, reason: String },
}

/// Errors from a single channel-recipient delivery.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("invalid {channel} recipient '{recipient}'")]
    InvalidRecipient { channel: Channel, recipient: String },

    #[error("no provider configured for channel {0}")]
    NotConfigured(Channel),

    #[error("provider rejected message with HTTP {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("transport error: {0}")]
    Transport(String),
}

impl From<reqwest::Error> for ChannelError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ChannelError::Transport(format!("timed out: {}", err))
        } else {
            ChannelError::Transport(err.to_string())
        }
    }
}

/// Errors loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("environment variable {0} must be set")]
    MissingEnv(&'static str),
}

/// Why an evaluation of one site produced no assessment (or a failed alert).
///
/// "No data yet" is always an `Err` here, never an `Ok` LOW assessment.
#[derive(Debug, thiserror::Error)]
pub enum EvaluationError {
    #[error("site {0} not found")]
    SiteNotFound(String),

    /// `source` is set when a provider call failed, and absent when the
    /// site simply has no fresh data.
    #[error("data unavailable for site {site_id}: {reason}")]
    DataUnavailable {
        site_id: String,
        reason: String,
        #[source]
        source: Option<DataSourceError>,
    },

    #[error("features unavailable for site {site_id}: {source}")]
    FeaturesUnavailable {
        site_id: String,
        #[source]
        source: ClassifierError,
    },

    #[error("configuration missing for site {site_id}: {reason}")]
    ConfigurationMissing { site_id: String, reason: String },

    #[error("evaluation of site {site_id} at {at} precedes its latest assessment at {latest}")]
    OutOfOrder {
        site_id: String,
        at: DateTime<Utc>,
        latest: DateTime<Utc>,
    },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl EvaluationError {
    pub fn data_unavailable(site_id: &str, reason: impl Into<String>) -> Self {
        EvaluationError::DataUnavailable {
            site_id: site_id.to_string(),
            reason: reason.into(),
            source: None,
        }
    }

    pub fn provider_failed(site_id: &str, source: DataSourceError) -> Self {
        EvaluationError::DataUnavailable {
            site_id: site_id.to_string(),
            reason: source.to_string(),
            source: Some(source),
        }
    }

    /// Short machine-readable kind, used as a log field.
    pub fn kind(&self) -> &'static str {
        match self {
            EvaluationError::SiteNotFound(_) => "site_not_found",
            EvaluationError::DataUnavailable { .. } => "data_unavailable",
            EvaluationError::FeaturesUnavailable { .. } => "features_unavailable",
            EvaluationError::ConfigurationMissing { .. } => "configuration_missing",
            EvaluationError::OutOfOrder { .. } => "out_of_order",
            EvaluationError::Storage(_) => "storage",
        }
    }
}
