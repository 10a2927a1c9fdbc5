//! Persistence for sites, feature snapshots, assessments and alert records.
//!
//! Everything above this layer talks to `dyn Storage`, so the pipeline runs
//! the same against the in-memory store (tests, dry runs) and PostgreSQL.
//! Implementations must be safe to share across the scheduler's workers.

pub mod memory;
pub mod pg;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StorageError;
use crate::model::{
    AlertRecord, AlertResolution, AlertStatus, FeatureSnapshot, RiskAssessment, RiskTier, Site, TimeRange,
};

pub use memory::MemoryStore;
pub use pg::PostgresStore;

pub trait Storage: Send + Sync {
    // --- Sites --------------------------------------------------------------

    fn active_sites(&self) -> Result<Vec<Site>, StorageError>;

    fn find_site(&self, site_id: &str) -> Result<Option<Site>, StorageError>;

    /// Inserts the site or replaces the stored copy with the same id.
    fn upsert_site(&self, site: &Site) -> Result<(), StorageError>;

    // --- Feature snapshots --------------------------------------------------

    fn latest_feature_snapshot(&self, site_id: &str) -> Result<Option<FeatureSnapshot>, StorageError>;

    /// The `limit` most recent snapshots, returned oldest first.
    fn recent_feature_history(&self, site_id: &str, limit: usize) -> Result<Vec<FeatureSnapshot>, StorageError>;

    /// Appends a snapshot. Fails with `OutOfOrderSnapshot` if it is older
    /// than the site's latest stored snapshot.
    fn append_feature_snapshot(&self, snapshot: &FeatureSnapshot) -> Result<(), StorageError>;

    // --- Assessments --------------------------------------------------------

    fn append_risk_assessment(&self, assessment: &RiskAssessment) -> Result<(), StorageError>;

    fn latest_assessment(&self, site_id: &str) -> Result<Option<RiskAssessment>, StorageError>;

    /// Assessments within `range`, oldest first.
    fn assessment_history(&self, site_id: &str, range: TimeRange) -> Result<Vec<RiskAssessment>, StorageError>;

    // --- Alerts -------------------------------------------------------------

    fn append_alert_record(&self, record: &AlertRecord) -> Result<(), StorageError>;

    /// Resolves a PENDING record and returns the stored result. Resolving a
    /// record twice fails with `AlertAlreadyResolved`.
    fn update_alert_record_status(&self, id: Uuid, resolution: &AlertResolution) -> Result<AlertRecord, StorageError>;

    /// Newest record for `{site, tier}` created at or after `since` whose
    /// status is one of `statuses`.
    fn most_recent_alert(
        &self,
        site_id: &str,
        tier: RiskTier,
        since: DateTime<Utc>,
        statuses: &[AlertStatus],
    ) -> Result<Option<AlertRecord>, StorageError>;

    /// PENDING records created strictly before `cutoff`, for the sweep.
    fn pending_alerts_created_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<AlertRecord>, StorageError>;
}
