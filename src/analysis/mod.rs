//! Feature engineering for the rockfall risk service.
//!
//! Both submodules are pure transforms: they read snapshots and events and
//! return new values, never touching storage.
//!
//! Submodules:
//! - `seismic`: decay-weighted scalar features from a list of seismic events.
//! - `rolling`: rolling statistics, interaction and temporal features, and
//!   z-score normalization over a site's recent history.

pub mod rolling;
pub mod seismic;

pub use rolling::{RollingFeatureEngine, normalize};
pub use seismic::{SeismicFeatureAggregator, SeismicFeatures, haversine_km};
