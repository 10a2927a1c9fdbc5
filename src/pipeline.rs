//! Per-site evaluation: snapshot in, assessment (and maybe an alert) out.
//!
//! One evaluation runs these steps in order, under a lock for the site:
//!
//!   1. load the site and its recent feature history (stale or empty
//!      history is `DataUnavailable`, never a LOW assessment)
//!   2. aggregate seismic events at the evaluation instant (fail-open)
//!   3. enrich the latest snapshot with rolling features
//!   4. classify and persist the assessment
//!   5. for MEDIUM and HIGH, claim the throttle, dispatch, and resolve the
//!      alert record
//!
//! The scheduler calls [`SiteEvaluator::evaluate_site_at`] for every active
//! site on each tick; operators call [`SiteEvaluator::evaluate_site`] on
//! demand.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use crate::alert::stalenesses::{is_snapshot_stale_at, snapshot_age_minutes};
use crate::alert::{AlertThrottle, Claim, RiskClassifier};
use crate::analysis::{RollingFeatureEngine, SeismicFeatureAggregator, SeismicFeatures};
use crate::config::{FeatureConfig, Settings};
use crate::error::{EvaluationError, StorageError};
use crate::ingest::SeismicSource;
use crate::logging::Source;
use crate::model::{
    AlertRecord, AlertResolution, AlertStatus, AssessmentStats, FeatureSnapshot, RiskAssessment, RiskTier, Site,
    TimeRange,
};
use crate::notify::{AlertMessage, NotificationDispatcher};
use crate::storage::Storage;

/// Written on the alert record when a site has nobody to notify.
pub const NO_CONTACTS_MESSAGE: &str = "no recipients configured";

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// What happened on the alerting side of one evaluation.
#[derive(Debug, Clone, PartialEq)]
pub enum AlertOutcome {
    /// The tier was LOW.
    NotRequired,
    /// A recent or in-flight alert for the same site and tier exists.
    Suppressed { blocking: Option<Uuid> },
    /// Delivery was attempted; the record holds SENT, PARTIAL or ERROR.
    Dispatched(AlertRecord),
}

#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationOutcome {
    pub assessment: RiskAssessment,
    pub alert: AlertOutcome,
}

impl EvaluationOutcome {
    pub fn alert_status(&self) -> Option<AlertStatus> {
        match &self.alert {
            AlertOutcome::Dispatched(record) => Some(record.status),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Evaluator
// ---------------------------------------------------------------------------

pub struct SiteEvaluator {
    storage: Arc<dyn Storage>,
    classifier: RiskClassifier,
    throttle: AlertThrottle,
    dispatcher: NotificationDispatcher,
    seismic: Option<Box<dyn SeismicSource>>,
    aggregator: SeismicFeatureAggregator,
    rolling: RollingFeatureEngine,
    features: FeatureConfig,
    site_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl SiteEvaluator {
    /// Builds an evaluator from settings. The classifier strategy, throttle
    /// windows and feature windows all come from `settings`.
    pub fn new(storage: Arc<dyn Storage>, settings: &Settings, dispatcher: NotificationDispatcher) -> Self {
        Self {
            classifier: RiskClassifier::from_config(&settings.classifier),
            throttle: AlertThrottle::new(storage.clone(), settings.throttle.clone()),
            dispatcher,
            seismic: None,
            aggregator: SeismicFeatureAggregator::new(settings.features.seismic_lookback()),
            rolling: RollingFeatureEngine::new(settings.features.rolling_windows.clone()),
            features: settings.features.clone(),
            site_locks: DashMap::new(),
            storage,
        }
    }

    /// Queries `source` for events at every evaluation. Without one, seismic
    /// features stored on the snapshot are used, or the baseline.
    pub fn with_seismic_source(mut self, source: Box<dyn SeismicSource>) -> Self {
        self.seismic = Some(source);
        self
    }

    pub fn with_classifier(mut self, classifier: RiskClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn classifier(&self) -> &RiskClassifier {
        &self.classifier
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// Evaluates one site now.
    pub fn evaluate_site(&self, site_id: &str) -> Result<EvaluationOutcome, EvaluationError> {
        self.evaluate_site_at(site_id, Utc::now())
    }

    /// Evaluates one site as of `now`.
    ///
    /// Evaluations of the same site are serialized, and an evaluation stamped
    /// before the site's latest assessment is refused.
    pub fn evaluate_site_at(&self, site_id: &str, now: DateTime<Utc>) -> Result<EvaluationOutcome, EvaluationError> {
        let lock = self
            .site_locks
            .entry(site_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _held = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let site = self
            .storage
            .find_site(site_id)?
            .ok_or_else(|| EvaluationError::SiteNotFound(site_id.to_string()))?;

        let mut history = self.storage.recent_feature_history(site_id, self.features.history_limit)?;
        let Some(latest) = history.last_mut() else {
            return Err(EvaluationError::data_unavailable(site_id, "no feature snapshots stored"));
        };
        if is_snapshot_stale_at(latest, self.features.max_snapshot_age(), now) {
            return Err(EvaluationError::data_unavailable(
                site_id,
                format!("latest feature snapshot is {} minutes old", snapshot_age_minutes(latest, now)),
            ));
        }

        if let Some(previous) = self.storage.latest_assessment(site_id)? {
            if previous.timestamp > now {
                return Err(EvaluationError::OutOfOrder {
                    site_id: site_id.to_string(),
                    at: now,
                    latest: previous.timestamp,
                });
            }
        }

        if let Some(seismic) = self.seismic_features(&site, latest, now) {
            seismic.apply_to(latest);
        }
        let enriched = self
            .rolling
            .enrich(&history)
            .ok_or_else(|| EvaluationError::data_unavailable(site_id, "no feature snapshots stored"))?;

        let started = Instant::now();
        let classification =
            self.classifier
                .classify(&enriched.features)
                .map_err(|source| EvaluationError::FeaturesUnavailable {
                    site_id: site_id.to_string(),
                    source,
                })?;
        let inference_ms = started.elapsed().as_secs_f64() * 1000.0;

        let assessment = RiskAssessment {
            id: Uuid::new_v4(),
            site_id: site_id.to_string(),
            timestamp: now,
            probability: classification.probability,
            tier: classification.tier,
            scorer: classification.scorer,
            features: enriched.features,
            inference_ms,
        };
        self.storage.append_risk_assessment(&assessment)?;

        tracing::info!(
            source = %Source::Classifier,
            site_id,
            tier = %assessment.tier,
            probability = assessment.probability,
            scorer = %assessment.scorer,
            "site assessed"
        );

        let alert = if assessment.tier >= RiskTier::Medium {
            self.alert(&site, &assessment, now)?
        } else {
            AlertOutcome::NotRequired
        };

        Ok(EvaluationOutcome { assessment, alert })
    }

    /// `None` keeps whatever the snapshot already carries.
    fn seismic_features(&self, site: &Site, latest: &FeatureSnapshot, now: DateTime<Utc>) -> Option<SeismicFeatures> {
        let stored = SeismicFeatures::present_on(latest);
        let Some(source) = &self.seismic else {
            return (!stored).then(SeismicFeatures::baseline);
        };

        match source.events_near(&site.location, now - self.aggregator.lookback(), now) {
            Ok(events) => Some(self.aggregator.aggregate(&events, now)),
            Err(e) => {
                tracing::warn!(
                    source = %Source::Seismic,
                    site_id = %site.id,
                    error = %e,
                    "seismic events unavailable; using {} features",
                    if stored { "stored" } else { "baseline" }
                );
                (!stored).then(SeismicFeatures::baseline)
            }
        }
    }

    fn alert(&self, site: &Site, assessment: &RiskAssessment, now: DateTime<Utc>) -> Result<AlertOutcome, EvaluationError> {
        let pending = match self.throttle.try_claim(&site.id, assessment.tier, assessment.id, now)? {
            Claim::Suppressed { blocking } => {
                return Ok(AlertOutcome::Suppressed {
                    blocking: blocking.map(|record| record.id),
                });
            }
            Claim::Granted(pending) => pending,
        };

        if site.contacts.is_empty() {
            let record = pending.resolve(&AlertResolution::failed(NO_CONTACTS_MESSAGE))?;
            tracing::error!(
                source = %Source::Dispatch,
                site_id = %site.id,
                alert_id = %record.id,
                tier = %record.tier,
                "alert not sent: site has no contacts"
            );
            return Err(EvaluationError::ConfigurationMissing {
                site_id: site.id.clone(),
                reason: NO_CONTACTS_MESSAGE.to_string(),
            });
        }

        let message = AlertMessage::format(site, assessment);
        let report = self.dispatcher.dispatch(&site.id, &site.contacts, &message, now);
        let record = pending.resolve(&report.into_resolution())?;

        match record.status {
            AlertStatus::Sent => tracing::info!(
                source = %Source::Dispatch, site_id = %site.id, alert_id = %record.id, tier = %record.tier,
                "alert sent"
            ),
            status => tracing::warn!(
                source = %Source::Dispatch, site_id = %site.id, alert_id = %record.id, tier = %record.tier,
                status = %status,
                error = record.error_message.as_deref().unwrap_or(""),
                failed_channels = ?record.failed_channels(),
                "alert delivery incomplete"
            ),
        }

        Ok(AlertOutcome::Dispatched(record))
    }

    // -----------------------------------------------------------------------
    // Read side
    // -----------------------------------------------------------------------

    pub fn latest_assessment(&self, site_id: &str) -> Result<Option<RiskAssessment>, StorageError> {
        self.storage.latest_assessment(site_id)
    }

    pub fn assessment_history(&self, site_id: &str, range: TimeRange) -> Result<Vec<RiskAssessment>, StorageError> {
        self.storage.assessment_history(site_id, range)
    }

    pub fn stats(&self, site_id: &str, range: TimeRange) -> Result<AssessmentStats, StorageError> {
        Ok(AssessmentStats::from_assessments(&self.assessment_history(site_id, range)?))
    }
}

impl std::fmt::Debug for SiteEvaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SiteEvaluator")
            .field("classifier", &self.classifier)
            .field("dispatcher", &self.dispatcher)
            .field("seismic", &self.seismic.is_some())
            .finish()
    }
}
