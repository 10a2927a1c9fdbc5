//! Alert throttling.
//!
//! A `{site, tier}` pair may alert at most once per window (MEDIUM 60 min,
//! HIGH 15 min by default). The history lives in storage as alert records;
//! the only in-process state is a lock per `{site, tier}` that serializes
//! the read, decide, write-PENDING sequence. A PENDING record younger than
//! `pending_in_flight_minutes` counts as "recently alerted", so a second
//! evaluation racing the first sees it and backs off instead of
//! double-sending. An older PENDING record was left by an evaluation that
//! died mid-dispatch; nothing was delivered, so it blocks nothing.
//!
//! A granted claim hands out a [`PendingAlert`]. Dropping it without
//! resolving (early return, error, panic) resolves the record to ERROR, so
//! no record stays PENDING because its task went away.

use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use crate::config::ThrottleConfig;
use crate::error::StorageError;
use crate::logging::Source;
use crate::model::{AlertRecord, AlertResolution, AlertStatus, RiskTier};
use crate::storage::Storage;

/// Message written on records abandoned by their evaluation.
pub const ABANDONED_MESSAGE: &str = "evaluation ended before the alert was resolved";

// ---------------------------------------------------------------------------
// Pending alert guard
// ---------------------------------------------------------------------------

pub struct PendingAlert {
    storage: Arc<dyn Storage>,
    record: AlertRecord,
    resolved: bool,
}

impl PendingAlert {
    fn new(storage: Arc<dyn Storage>, record: AlertRecord) -> Self {
        Self {
            storage,
            record,
            resolved: false,
        }
    }

    pub fn record(&self) -> &AlertRecord {
        &self.record
    }

    /// Writes the terminal state and returns the stored record.
    ///
    /// If storage refuses the update, the guard is still armed and will try
    /// to resolve the record to ERROR when dropped.
    pub fn resolve(mut self, resolution: &AlertResolution) -> Result<AlertRecord, StorageError> {
        let stored = self.storage.update_alert_record_status(self.record.id, resolution)?;
        self.resolved = true;
        Ok(stored)
    }
}

impl Drop for PendingAlert {
    fn drop(&mut self) {
        if self.resolved {
            return;
        }
        let resolution = AlertResolution::failed(ABANDONED_MESSAGE);
        match self.storage.update_alert_record_status(self.record.id, &resolution) {
            Ok(_) | Err(StorageError::AlertAlreadyResolved { .. }) => tracing::warn!(
                source = %Source::Throttle,
                site_id = %self.record.site_id,
                alert_id = %self.record.id,
                "pending alert abandoned; resolved to ERROR"
            ),
            Err(e) => tracing::error!(
                source = %Source::Throttle,
                site_id = %self.record.site_id,
                alert_id = %self.record.id,
                error = %e,
                "could not resolve abandoned alert; the sweep will retry"
            ),
        }
    }
}

impl std::fmt::Debug for PendingAlert {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingAlert")
            .field("record", &self.record)
            .field("resolved", &self.resolved)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Throttle
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum Claim {
    /// No recent alert; a PENDING record now exists and must be resolved.
    Granted(PendingAlert),
    /// A recent or in-flight alert blocks this one. `None` for LOW.
    Suppressed { blocking: Option<AlertRecord> },
}

pub struct AlertThrottle {
    storage: Arc<dyn Storage>,
    config: ThrottleConfig,
    locks: DashMap<(String, RiskTier), Arc<Mutex<()>>>,
}

impl AlertThrottle {
    pub fn new(storage: Arc<dyn Storage>, config: ThrottleConfig) -> Self {
        Self {
            storage,
            config,
            locks: DashMap::new(),
        }
    }

    /// Delivered statuses that hold the whole window. PENDING holds only
    /// the in-flight bound.
    pub fn blocking_statuses(&self) -> Vec<AlertStatus> {
        let mut statuses = vec![AlertStatus::Sent];
        if self.config.count_partial {
            statuses.push(AlertStatus::Partial);
        }
        statuses
    }

    /// Whether a `{site, tier}` alert would be permitted at `now`.
    ///
    /// Read-only; use [`try_claim`](Self::try_claim) to actually reserve it.
    pub fn should_alert(&self, site_id: &str, tier: RiskTier, now: DateTime<Utc>) -> Result<bool, StorageError> {
        if tier == RiskTier::Low {
            return Ok(false);
        }
        Ok(self.window_blocker(site_id, tier, now)?.is_none())
    }

    /// Checks eligibility and, if permitted, records a PENDING alert for
    /// `assessment_id`, all under the `{site, tier}` lock.
    pub fn try_claim(
        &self,
        site_id: &str,
        tier: RiskTier,
        assessment_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Claim, StorageError> {
        if tier == RiskTier::Low {
            return Ok(Claim::Suppressed { blocking: None });
        }

        let lock = self
            .locks
            .entry((site_id.to_string(), tier))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _held = lock.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(blocking) = self.window_blocker(site_id, tier, now)? {
            tracing::info!(
                source = %Source::Throttle,
                site_id,
                tier = %tier,
                blocking_alert = %blocking.id,
                blocking_status = %blocking.status,
                "alert suppressed by throttle window"
            );
            return Ok(Claim::Suppressed {
                blocking: Some(blocking),
            });
        }

        let record = AlertRecord::pending(assessment_id, site_id, tier, now);
        self.storage.append_alert_record(&record)?;
        tracing::debug!(source = %Source::Throttle, site_id, tier = %tier, alert_id = %record.id, "alert claimed");
        Ok(Claim::Granted(PendingAlert::new(self.storage.clone(), record)))
    }

    fn window_blocker(
        &self,
        site_id: &str,
        tier: RiskTier,
        now: DateTime<Utc>,
    ) -> Result<Option<AlertRecord>, StorageError> {
        let Some(window) = self.config.window(tier) else {
            return Ok(None);
        };
        let delivered = self
            .storage
            .most_recent_alert(site_id, tier, now - window, &self.blocking_statuses())?;
        if delivered.is_some() {
            return Ok(delivered);
        }
        let in_flight_since = (now - self.config.pending_in_flight()).max(now - window);
        self.storage
            .most_recent_alert(site_id, tier, in_flight_since, &[AlertStatus::Pending])
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
