//! Rockfall risk monitoring service.
//!
//! Collects weather and seismic signals for monitored slopes, scores the
//! risk of rockfall per site, and notifies site contacts by email and SMS
//! when risk reaches MEDIUM or HIGH, at most once per throttle window.

pub mod alert;
pub mod analysis;
pub mod config;
pub mod error;
pub mod ingest;
pub mod logging;
pub mod model;
pub mod notify;
pub mod pipeline;
pub mod scheduler;
pub mod sites;
pub mod storage;
pub mod verify;

pub use pipeline::{AlertOutcome, EvaluationOutcome, SiteEvaluator};
pub use scheduler::{CycleSummary, ShutdownHandle, SiteEvaluationScheduler};
