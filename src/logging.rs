//! Structured logging for the rockfall risk service
//!
//! Every line carries a `source` field naming the pipeline stage and, where
//! one applies, the `site_id`. Evaluation failures are classified before
//! logging so that expected conditions (no data yet) don't drown out the
//! unexpected ones (storage down, misconfigured site).

use std::fmt;

use tracing_subscriber::EnvFilter;

use crate::error::{DataSourceError, EvaluationError};

// ---------------------------------------------------------------------------
// Pipeline Sources
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Weather,
    Seismic,
    Storage,
    Classifier,
    Throttle,
    Dispatch,
    Scheduler,
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Weather => write!(f, "WX"),
            Source::Seismic => write!(f, "SEIS"),
            Source::Storage => write!(f, "DB"),
            Source::Classifier => write!(f, "RISK"),
            Source::Throttle => write!(f, "THROTTLE"),
            Source::Dispatch => write!(f, "NOTIFY"),
            Source::Scheduler => write!(f, "SYS"),
        }
    }
}

// ---------------------------------------------------------------------------
// Failure Classification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureType {
    /// Expected failure - site has no fresh data yet, retried next tick
    Expected,
    /// Unexpected failure - indicates service degradation or configuration issue
    Unexpected,
    /// Unknown - cannot determine if this is expected or not
    Unknown,
}

impl fmt::Display for FailureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureType::Expected => write!(f, "EXPECTED"),
            FailureType::Unexpected => write!(f, "UNEXPECTED"),
            FailureType::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// Classify a per-site evaluation failure.
pub fn classify_evaluation_failure(err: &EvaluationError) -> FailureType {
    match err {
        // A provider erroring is degradation; a site that simply hasn't
        // reported yet is not.
        EvaluationError::DataUnavailable { source, .. } => match source {
            None => FailureType::Expected,
            Some(DataSourceError::Http { .. } | DataSourceError::Transport { .. }) => FailureType::Unexpected,
            Some(DataSourceError::Parse { .. }) => FailureType::Unknown,
        },
        EvaluationError::FeaturesUnavailable { .. } => FailureType::Unknown,
        EvaluationError::ConfigurationMissing { .. } => FailureType::Unexpected,
        EvaluationError::SiteNotFound(_) | EvaluationError::OutOfOrder { .. } => FailureType::Unknown,
        EvaluationError::Storage(_) => FailureType::Unexpected,
    }
}

// ---------------------------------------------------------------------------
// Initialisation
// ---------------------------------------------------------------------------

/// Initialise the global subscriber.
///
/// `RUST_LOG` wins over `default_level` when set. Calling this twice is
/// harmless; the second call is ignored.
pub fn init_logging(default_level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_names(true);

    let result = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if let Err(e) = result {
        eprintln!("logging already initialised: {}", e);
    }
}

// ---------------------------------------------------------------------------
// Structured Failure Logging
// ---------------------------------------------------------------------------

/// Log an evaluation failure with automatic classification.
pub fn log_evaluation_failure(site_id: &str, err: &EvaluationError) {
    let failure_type = classify_evaluation_failure(err);
    let source = match err {
        EvaluationError::FeaturesUnavailable { .. } => Source::Classifier,
        EvaluationError::ConfigurationMissing { .. } => Source::Dispatch,
        EvaluationError::Storage(_) | EvaluationError::SiteNotFound(_) => Source::Storage,
        EvaluationError::DataUnavailable { .. } | EvaluationError::OutOfOrder { .. } => Source::Scheduler,
    };

    match failure_type {
        FailureType::Expected => tracing::debug!(
            source = %source, site_id, kind = err.kind(), failure = %failure_type,
            "evaluation skipped: {}", err
        ),
        FailureType::Unexpected => tracing::error!(
            source = %source, site_id, kind = err.kind(), failure = %failure_type,
            "evaluation failed: {}", err
        ),
        FailureType::Unknown => tracing::warn!(
            source = %source, site_id, kind = err.kind(), failure = %failure_type,
            "evaluation failed: {}", err
        ),
    }
}

// ---------------------------------------------------------------------------
// Cycle Summary Logging
// ---------------------------------------------------------------------------

/// Log a summary of one scheduler cycle.
pub fn log_cycle_summary(total: usize, evaluated: usize, failed: usize, alerts_sent: usize, suppressed: usize) {
    let message = format!(
        "Cycle complete: {}/{} evaluated, {} failed, {} alerts dispatched, {} suppressed",
        evaluated, total, failed, alerts_sent, suppressed
    );

    if failed == 0 {
        tracing::info!(source = %Source::Scheduler, "{}", message);
    } else if evaluated == 0 {
        tracing::error!(source = %Source::Scheduler, "{}", message);
    } else {
        tracing::warn!(source = %Source::Scheduler, "{}", message);
    }
}
