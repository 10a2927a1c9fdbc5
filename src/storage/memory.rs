//! In-memory storage.
//!
//! Used by the integration tests and by `--dry-run`. All state sits behind
//! one mutex, so every trait method is atomic with respect to the others.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::Storage;
use crate::error::StorageError;
use crate::model::{
    AlertRecord, AlertResolution, AlertStatus, FeatureSnapshot, RiskAssessment, RiskTier, Site, TimeRange,
};

#[derive(Debug, Default)]
struct Inner {
    /// Kept in insertion order so `active_sites` is stable.
    sites: Vec<Site>,
    snapshots: HashMap<String, Vec<FeatureSnapshot>>,
    assessments: HashMap<String, Vec<RiskAssessment>>,
    alerts: Vec<AlertRecord>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store pre-populated with `sites`.
    pub fn with_sites(sites: impl IntoIterator<Item = Site>) -> Self {
        let store = Self::new();
        store.lock().sites.extend(sites);
        store
    }

    /// Every alert record, in creation order. For tests and inspection.
    pub fn alert_records(&self) -> Vec<AlertRecord> {
        self.lock().alerts.clone()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Storage for MemoryStore {
    fn active_sites(&self) -> Result<Vec<Site>, StorageError> {
        Ok(self.lock().sites.iter().filter(|s| s.is_active).cloned().collect())
    }

    fn find_site(&self, site_id: &str) -> Result<Option<Site>, StorageError> {
        Ok(self.lock().sites.iter().find(|s| s.id == site_id).cloned())
    }

    fn upsert_site(&self, site: &Site) -> Result<(), StorageError> {
        let mut inner = self.lock();
        match inner.sites.iter_mut().find(|s| s.id == site.id) {
            Some(existing) => *existing = site.clone(),
            None => inner.sites.push(site.clone()),
        }
        Ok(())
    }

    fn latest_feature_snapshot(&self, site_id: &str) -> Result<Option<FeatureSnapshot>, StorageError> {
        Ok(self
            .lock()
            .snapshots
            .get(site_id)
            .and_then(|list| list.last())
            .cloned())
    }

    fn recent_feature_history(&self, site_id: &str, limit: usize) -> Result<Vec<FeatureSnapshot>, StorageError> {
        let inner = self.lock();
        let Some(list) = inner.snapshots.get(site_id) else {
            return Ok(Vec::new());
        };
        let start = list.len().saturating_sub(limit);
        Ok(list[start..].to_vec())
    }

    fn append_feature_snapshot(&self, snapshot: &FeatureSnapshot) -> Result<(), StorageError> {
        let mut inner = self.lock();
        let list = inner.snapshots.entry(snapshot.site_id.clone()).or_default();
        if let Some(latest) = list.last() {
            if snapshot.timestamp < latest.timestamp {
                return Err(StorageError::OutOfOrderSnapshot {
                    site_id: snapshot.site_id.clone(),
                    timestamp: snapshot.timestamp,
                    latest: latest.timestamp,
                });
            }
        }
        list.push(snapshot.clone());
        Ok(())
    }

    fn append_risk_assessment(&self, assessment: &RiskAssessment) -> Result<(), StorageError> {
        self.lock()
            .assessments
            .entry(assessment.site_id.clone())
            .or_default()
            .push(assessment.clone());
        Ok(())
    }

    fn latest_assessment(&self, site_id: &str) -> Result<Option<RiskAssessment>, StorageError> {
        Ok(self
            .lock()
            .assessments
            .get(site_id)
            .and_then(|list| list.iter().max_by_key(|a| a.timestamp))
            .cloned())
    }

    fn assessment_history(&self, site_id: &str, range: TimeRange) -> Result<Vec<RiskAssessment>, StorageError> {
        let inner = self.lock();
        let mut history: Vec<RiskAssessment> = inner
            .assessments
            .get(site_id)
            .map(|list| list.iter().filter(|a| range.contains(a.timestamp)).cloned().collect())
            .unwrap_or_default();
        history.sort_by_key(|a| a.timestamp);
        Ok(history)
    }

    fn append_alert_record(&self, record: &AlertRecord) -> Result<(), StorageError> {
        self.lock().alerts.push(record.clone());
        Ok(())
    }

    fn update_alert_record_status(&self, id: Uuid, resolution: &AlertResolution) -> Result<AlertRecord, StorageError> {
        let mut inner = self.lock();
        let record = inner
            .alerts
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or(StorageError::AlertNotFound(id))?;
        record.resolve(resolution)?;
        Ok(record.clone())
    }

    fn most_recent_alert(
        &self,
        site_id: &str,
        tier: RiskTier,
        since: DateTime<Utc>,
        statuses: &[AlertStatus],
    ) -> Result<Option<AlertRecord>, StorageError> {
        Ok(self
            .lock()
            .alerts
            .iter()
            .filter(|r| r.site_id == site_id && r.tier == tier)
            .filter(|r| r.created_at >= since && statuses.contains(&r.status))
            .max_by_key(|r| r.created_at)
            .cloned())
    }

    fn pending_alerts_created_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<AlertRecord>, StorageError> {
        Ok(self
            .lock()
            .alerts
            .iter()
            .filter(|r| r.status == AlertStatus::Pending && r.created_at < cutoff)
            .cloned()
            .collect())
    }
}
