//! Data ingestion from external providers.
//!
//! Submodules:
//! - `weather`: current conditions from an OpenWeatherMap-style API.
//! - `seismic`: earthquake events from an FDSN event web service (GeoJSON).
//! - `collector`: turns a weather observation plus stored history into a
//!   new feature snapshot.
//!
//! Providers sit behind traits so the pipeline and its tests can swap in
//! fixed data. Every provider failure is a `DataSourceError`, which the
//! pipeline reports as `DataUnavailable`.

pub mod collector;
pub mod seismic;
pub mod weather;

use chrono::{DateTime, Utc};

use crate::error::DataSourceError;
use crate::model::{Location, SeismicEvent};

pub use collector::FeatureCollector;
pub use seismic::FdsnEventClient;
pub use weather::OpenWeatherClient;

/// Current conditions at a location.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeatherObservation {
    pub observed_at: DateTime<Utc>,
    pub temperature_c: f64,
    pub humidity_pct: f64,
    /// Rain over the last hour; 0 when the provider reports none.
    pub rain_1h_mm: f64,
}

pub trait WeatherSource: Send + Sync {
    fn current(&self, location: &Location) -> Result<WeatherObservation, DataSourceError>;
}

pub trait SeismicSource: Send + Sync {
    /// Events near `location` between `start` and `end`, with distances
    /// already computed relative to `location`.
    fn events_near(
        &self,
        location: &Location,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<SeismicEvent>, DataSourceError>;
}
