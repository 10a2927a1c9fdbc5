//! Pluggable scoring models.
//!
//! A model is trained offline and shipped as a JSON artifact; this module only
//! loads and evaluates it. The artifact format is a plain logistic regression:
//!
//! ```json
//! {
//!   "version": "logreg-2024-05",
//!   "feature_columns": ["rain_24h_mm", "rain_72h_mm", "max_magnitude_72h"],
//!   "coefficients": [0.04, 0.03, 0.5],
//!   "intercept": -3.2,
//!   "fill_values": { "minutes_since_m3": 4320.0 }
//! }
//! ```
//!
//! `fill_values` is optional and stands in for a column that is absent or
//! non-finite (e.g. `minutes_since_m3 = +inf` when no M3 event occurred).

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;

use crate::error::ClassifierError;
use crate::model::FeatureMap;

/// Something that turns a feature map into a probability in [0, 1].
pub trait ScoringModel: Send + Sync {
    /// Version string recorded on every assessment the model scores.
    fn version(&self) -> &str;

    fn score(&self, features: &FeatureMap) -> Result<f64, ClassifierError>;
}

// ---------------------------------------------------------------------------
// Logistic regression artifact
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LogisticModel {
    pub version: String,
    pub feature_columns: Vec<String>,
    pub coefficients: Vec<f64>,
    pub intercept: f64,
    #[serde(default)]
    pub fill_values: BTreeMap<String, f64>,
}

impl LogisticModel {
    /// Parses and validates an artifact. `origin` is only used in errors.
    pub fn from_json_str(contents: &str, origin: &str) -> Result<Self, ClassifierError> {
        let model: LogisticModel = serde_json::from_str(contents).map_err(|e| ClassifierError::Artifact {
            path: origin.to_string(),
            reason: e.to_string(),
        })?;
        model.validate(origin)?;
        Ok(model)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ClassifierError> {
        let path = path.as_ref();
        let origin = path.display().to_string();
        let contents = std::fs::read_to_string(path).map_err(|e| ClassifierError::Artifact {
            path: origin.clone(),
            reason: e.to_string(),
        })?;
        Self::from_json_str(&contents, &origin)
    }

    fn validate(&self, origin: &str) -> Result<(), ClassifierError> {
        let invalid = |reason: String| ClassifierError::Artifact {
            path: origin.to_string(),
            reason,
        };
        if self.version.trim().is_empty() {
            return Err(invalid("version must not be empty".to_string()));
        }
        if self.feature_columns.len() != self.coefficients.len() {
            return Err(invalid(format!(
                "{} feature columns but {} coefficients",
                self.feature_columns.len(),
                self.coefficients.len()
            )));
        }
        if !self.intercept.is_finite() || self.coefficients.iter().any(|c| !c.is_finite()) {
            return Err(invalid("coefficients and intercept must be finite".to_string()));
        }
        Ok(())
    }

    fn column_value(&self, features: &FeatureMap, column: &str) -> Option<f64> {
        features
            .get(column)
            .copied()
            .filter(|v| v.is_finite())
            .or_else(|| self.fill_values.get(column).copied())
    }
}

impl ScoringModel for LogisticModel {
    fn version(&self) -> &str {
        &self.version
    }

    fn score(&self, features: &FeatureMap) -> Result<f64, ClassifierError> {
        let mut missing = Vec::new();
        let mut z = self.intercept;

        for (column, coefficient) in self.feature_columns.iter().zip(&self.coefficients) {
            match self.column_value(features, column) {
                Some(x) => z += coefficient * x,
                None => missing.push(column.clone()),
            }
        }

        if !missing.is_empty() {
            return Err(ClassifierError::FeaturesUnavailable { missing });
        }
        if !z.is_finite() {
            return Err(ClassifierError::Model {
                version: self.version.clone(),
                reason: format!("linear term is not finite ({})", z),
            });
        }

        Ok(1.0 / (1.0 + (-z).exp()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
