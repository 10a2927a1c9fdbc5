//! Staleness checks for feature data and alert records.
//!
//! Two kinds of "too old" matter to the pipeline:
//! - a feature snapshot too old to evaluate (a data feed has stopped, and
//!   classifying yesterday's rain as today's risk would be misleading);
//! - an alert record stuck in PENDING because its evaluation died between
//!   claiming the alert and resolving it.
//!
//! # Clock injection
//! All functions accept a `now: DateTime<Utc>` parameter rather than calling
//! `Utc::now()` internally, so tests stay deterministic.

use chrono::{DateTime, Duration, Utc};

use crate::error::StorageError;
use crate::logging::Source;
use crate::model::{AlertResolution, FeatureSnapshot};
use crate::storage::Storage;

// ---------------------------------------------------------------------------
// Snapshot staleness
// ---------------------------------------------------------------------------

/// Returns `true` if the snapshot is older than `max_age` relative to `now`.
///
/// Staleness is strictly greater than the threshold:
///   age > max_age  →  stale
///   age == max_age →  not stale
/// A snapshot stamped in the future is never stale.
pub fn is_snapshot_stale_at(snapshot: &FeatureSnapshot, max_age: Duration, now: DateTime<Utc>) -> bool {
    now - snapshot.timestamp > max_age
}

/// Age of a snapshot in whole minutes, floored at zero.
pub fn snapshot_age_minutes(snapshot: &FeatureSnapshot, now: DateTime<Utc>) -> i64 {
    (now - snapshot.timestamp).num_minutes().max(0)
}

// ---------------------------------------------------------------------------
// PENDING alert reconciliation
// ---------------------------------------------------------------------------

/// Resolves every PENDING alert created more than `max_age` before `now` to
/// ERROR. Returns how many records were resolved.
///
/// A record resolved concurrently by its own evaluation is skipped; any
/// other storage failure aborts the sweep and is returned.
pub fn reconcile_stale_pending(
    storage: &dyn Storage,
    max_age: Duration,
    now: DateTime<Utc>,
) -> Result<usize, StorageError> {
    let cutoff = now - max_age;
    let stale = storage.pending_alerts_created_before(cutoff)?;
    let mut resolved = 0;

    for record in stale {
        let message = format!(
            "alert still pending after {} minutes; resolved by reconciliation",
            (now - record.created_at).num_minutes()
        );
        match storage.update_alert_record_status(record.id, &AlertResolution::failed(message)) {
            Ok(_) => {
                resolved += 1;
                tracing::warn!(
                    source = %Source::Throttle,
                    site_id = %record.site_id,
                    alert_id = %record.id,
                    tier = %record.tier,
                    "stale pending alert resolved to ERROR"
                );
            }
            Err(StorageError::AlertAlreadyResolved { .. }) => {}
            Err(e) => return Err(e),
        }
    }

    Ok(resolved)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
