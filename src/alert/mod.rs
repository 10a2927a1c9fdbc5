//! Risk classification and alert gating.
//!
//! Submodules:
//! - `thresholds`: `RiskClassifier`, probability and tier from features.
//! - `scoring`: the `ScoringModel` trait and the logistic model artifact.
//! - `throttle`: `AlertThrottle`, per-site, per-tier alert windows.
//! - `stalenesses`: stale snapshot checks and the PENDING alert sweep.

pub mod scoring;
pub mod stalenesses;
pub mod thresholds;
pub mod throttle;

pub use scoring::{LogisticModel, ScoringModel};
pub use thresholds::{Classification, RiskClassifier, TierThresholds};
pub use throttle::{AlertThrottle, Claim, PendingAlert};
