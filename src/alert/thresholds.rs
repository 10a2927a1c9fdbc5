//! Risk classification.
//!
//! Turns an enriched feature map into a probability and a discrete tier. The
//! scoring strategy is chosen once from configuration: either the fixed
//! rule set, or a model artifact loaded by version. Tier mapping is the same
//! for both.

use serde::Serialize;

use crate::alert::scoring::{LogisticModel, ScoringModel};
use crate::config::{ClassifierConfig, RuleSet, Strategy};
use crate::error::ClassifierError;
use crate::logging::Source;
use crate::model::{FeatureMap, HUMIDITY, MAX_MAGNITUDE, RAIN_24H, RAIN_72H, RiskTier};

/// Scorer name recorded on assessments produced by the rule set.
pub const RULE_BASED: &str = "rule-based";

/// Features the rule set reads. A zero reading is valid; an absent or
/// non-finite one is not.
pub const RULE_FEATURES: &[&str] = &[RAIN_24H, RAIN_72H, MAX_MAGNITUDE, HUMIDITY];

// ---------------------------------------------------------------------------
// Tiers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TierThresholds {
    pub high: f64,
    pub medium: f64,
}

impl Default for TierThresholds {
    fn default() -> Self {
        Self { high: 0.6, medium: 0.4 }
    }
}

impl TierThresholds {
    pub fn tier_for(&self, probability: f64) -> RiskTier {
        if probability >= self.high {
            RiskTier::High
        } else if probability >= self.medium {
            RiskTier::Medium
        } else {
            RiskTier::Low
        }
    }
}

// ---------------------------------------------------------------------------
// Strategies
// ---------------------------------------------------------------------------

pub enum ScoringStrategy {
    RuleBased(RuleSet),
    Model(Box<dyn ScoringModel>),
}

impl std::fmt::Debug for ScoringStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScoringStrategy::RuleBased(rules) => f.debug_tuple("RuleBased").field(rules).finish(),
            ScoringStrategy::Model(model) => f.debug_tuple("Model").field(&model.version()).finish(),
        }
    }
}

/// Probability from the fixed rule set: the largest factor among the rules
/// that fire, or the baseline when none does.
pub fn rule_based_probability(features: &FeatureMap, rules: &RuleSet) -> Result<f64, ClassifierError> {
    let missing: Vec<String> = RULE_FEATURES
        .iter()
        .filter(|key| !features.get(**key).is_some_and(|v| v.is_finite()))
        .map(|key| key.to_string())
        .collect();
    if !missing.is_empty() {
        return Err(ClassifierError::FeaturesUnavailable { missing });
    }

    // All four are present and finite past this point.
    let value = |key: &str| features.get(key).copied().unwrap_or_default();

    let fired = [
        (value(RAIN_24H) > rules.rain_24h_mm, rules.rain_24h_factor),
        (value(RAIN_72H) > rules.rain_72h_mm, rules.rain_72h_factor),
        (value(MAX_MAGNITUDE) >= rules.magnitude, rules.magnitude_factor),
        (value(HUMIDITY) > rules.humidity_pct, rules.humidity_factor),
    ];

    Ok(fired
        .iter()
        .filter(|(hit, _)| *hit)
        .map(|(_, factor)| *factor)
        .reduce(f64::max)
        .unwrap_or(rules.baseline))
}

// ---------------------------------------------------------------------------
// Classifier
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Classification {
    pub probability: f64,
    pub tier: RiskTier,
    pub scorer: String,
}

#[derive(Debug)]
pub struct RiskClassifier {
    strategy: ScoringStrategy,
    thresholds: TierThresholds,
}

impl RiskClassifier {
    pub fn rule_based(rules: RuleSet, thresholds: TierThresholds) -> Self {
        Self {
            strategy: ScoringStrategy::RuleBased(rules),
            thresholds,
        }
    }

    pub fn with_model(model: Box<dyn ScoringModel>, thresholds: TierThresholds) -> Self {
        Self {
            strategy: ScoringStrategy::Model(model),
            thresholds,
        }
    }

    /// Builds the classifier named by configuration.
    ///
    /// A model artifact that cannot be loaded is not fatal: the classifier
    /// falls back to the rule set and logs a warning.
    pub fn from_config(config: &ClassifierConfig) -> Self {
        let thresholds = TierThresholds {
            high: config.high_threshold,
            medium: config.medium_threshold,
        };

        if config.strategy == Strategy::Model {
            match config.model_path.as_deref().map(|path| LogisticModel::load(path)) {
                Some(Ok(model)) => {
                    tracing::info!(source = %Source::Classifier, version = %model.version, "scoring model loaded");
                    return Self::with_model(Box::new(model), thresholds);
                }
                Some(Err(e)) => {
                    tracing::warn!(source = %Source::Classifier, error = %e, "falling back to rule-based scoring");
                }
                None => {
                    tracing::warn!(source = %Source::Classifier, "no model path configured; using rule-based scoring");
                }
            }
        }

        Self::rule_based(config.rules.clone(), thresholds)
    }

    pub fn thresholds(&self) -> TierThresholds {
        self.thresholds
    }

    /// `rule-based`, or the version of the loaded model.
    pub fn scorer(&self) -> &str {
        match &self.strategy {
            ScoringStrategy::RuleBased(_) => RULE_BASED,
            ScoringStrategy::Model(model) => model.version(),
        }
    }

    /// Probability in [0, 1], before tier mapping.
    pub fn score(&self, features: &FeatureMap) -> Result<f64, ClassifierError> {
        let p = match &self.strategy {
            ScoringStrategy::RuleBased(rules) => rule_based_probability(features, rules)?,
            ScoringStrategy::Model(model) => model.score(features)?,
        };
        if p.is_nan() {
            return Err(ClassifierError::Model {
                version: self.scorer().to_string(),
                reason: "probability is NaN".to_string(),
            });
        }
        Ok(p.clamp(0.0, 1.0))
    }

    pub fn classify(&self, features: &FeatureMap) -> Result<Classification, ClassifierError> {
        let probability = self.score(features)?;
        Ok(Classification {
            probability,
            tier: self.thresholds.tier_for(probability),
            scorer: self.scorer().to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
