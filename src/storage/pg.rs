//! PostgreSQL storage.
//!
//! Schema lives in `sql/001_rockfall_schema.sql`. Feature maps are stored as
//! JSONB through `model::feature_values`, so `+inf` survives the round trip.
//!
//! The blocking `postgres::Client` is not shareable, so it sits behind a
//! mutex; with the scheduler's small worker pool that is not a bottleneck.
//! Every statement runs under a server-side `statement_timeout`.

use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use postgres::{Client, NoTls, Row};
use uuid::Uuid;

use super::Storage;
use crate::error::StorageError;
use crate::model::{
    AlertRecord, AlertResolution, AlertStatus, Channel, Contacts, DeliveryAttempt, FeatureSnapshot, Location,
    RiskAssessment, RiskTier, Site, TimeRange, feature_values,
};

const SITE_COLUMNS: &str = "site_id, name, latitude, longitude, elevation_m, is_active, emails, phones";
const ASSESSMENT_COLUMNS: &str = "assessment_id, site_id, assessed_at, probability, tier, scorer, features, inference_ms";
const ALERT_COLUMNS: &str =
    "alert_id, assessment_id, site_id, tier, status, channels, deliveries, error_message, created_at, sent_at";

pub struct PostgresStore {
    client: Mutex<Client>,
}

impl PostgresStore {
    /// Connects with `timeout` applied both to the connection attempt and,
    /// as `statement_timeout`, to every statement.
    pub fn connect(database_url: &str, timeout: Duration) -> Result<Self, StorageError> {
        let mut config = postgres::Config::from_str(database_url)?;
        config
            .connect_timeout(timeout)
            .options(&format!("-c statement_timeout={}", timeout.as_millis()));
        let client = config.connect(NoTls)?;
        Ok(Self::from_client(client))
    }

    pub fn from_client(client: Client) -> Self {
        Self {
            client: Mutex::new(client),
        }
    }

    /// Applies the bundled schema. Idempotent.
    pub fn migrate(&self) -> Result<(), StorageError> {
        self.client()
            .batch_execute(include_str!("../../sql/001_rockfall_schema.sql"))?;
        Ok(())
    }

    fn client(&self) -> MutexGuard<'_, Client> {
        self.client.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn corrupt(what: &str, err: impl std::fmt::Display) -> StorageError {
    StorageError::Corrupt(format!("{}: {}", what, err))
}

fn row_to_site(row: &Row) -> Result<Site, StorageError> {
    Ok(Site {
        id: row.try_get("site_id")?,
        name: row.try_get("name")?,
        location: Location {
            latitude: row.try_get("latitude")?,
            longitude: row.try_get("longitude")?,
            elevation_m: row.try_get("elevation_m")?,
        },
        is_active: row.try_get("is_active")?,
        contacts: Contacts {
            emails: row.try_get("emails")?,
            phones: row.try_get("phones")?,
        },
    })
}

fn row_to_snapshot(row: &Row) -> Result<FeatureSnapshot, StorageError> {
    let features: serde_json::Value = row.try_get("features")?;
    Ok(FeatureSnapshot {
        site_id: row.try_get("site_id")?,
        timestamp: row.try_get("recorded_at")?,
        features: feature_values::from_json(features).map_err(|e| corrupt("snapshot features", e))?,
    })
}

fn row_to_assessment(row: &Row) -> Result<RiskAssessment, StorageError> {
    let tier: String = row.try_get("tier")?;
    let features: serde_json::Value = row.try_get("features")?;
    Ok(RiskAssessment {
        id: row.try_get("assessment_id")?,
        site_id: row.try_get("site_id")?,
        timestamp: row.try_get("assessed_at")?,
        probability: row.try_get("probability")?,
        tier: tier.parse().map_err(|e: String| corrupt("assessment tier", e))?,
        scorer: row.try_get("scorer")?,
        features: feature_values::from_json(features).map_err(|e| corrupt("assessment features", e))?,
        inference_ms: row.try_get("inference_ms")?,
    })
}

fn row_to_alert(row: &Row) -> Result<AlertRecord, StorageError> {
    let tier: String = row.try_get("tier")?;
    let status: String = row.try_get("status")?;
    let channels: Vec<String> = row.try_get("channels")?;
    let deliveries: serde_json::Value = row.try_get("deliveries")?;

    let channels = channels
        .iter()
        .map(|c| Channel::from_str(c))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| corrupt("alert channels", e))?;
    let deliveries: Vec<DeliveryAttempt> =
        serde_json::from_value(deliveries).map_err(|e| corrupt("alert deliveries", e))?;

    Ok(AlertRecord {
        id: row.try_get("alert_id")?,
        assessment_id: row.try_get("assessment_id")?,
        site_id: row.try_get("site_id")?,
        tier: tier.parse().map_err(|e: String| corrupt("alert tier", e))?,
        status: status.parse().map_err(|e: String| corrupt("alert status", e))?,
        channels,
        deliveries,
        error_message: row.try_get("error_message")?,
        created_at: row.try_get("created_at")?,
        sent_at: row.try_get("sent_at")?,
    })
}

fn channel_names(channels: &[Channel]) -> Vec<String> {
    channels.iter().map(|c| c.as_str().to_string()).collect()
}

fn deliveries_json(deliveries: &[DeliveryAttempt]) -> Result<serde_json::Value, StorageError> {
    serde_json::to_value(deliveries).map_err(|e| corrupt("alert deliveries", e))
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

impl Storage for PostgresStore {
    fn active_sites(&self) -> Result<Vec<Site>, StorageError> {
        let rows = self.client().query(
            &format!("SELECT {} FROM rockfall_sites WHERE is_active ORDER BY site_id", SITE_COLUMNS),
            &[],
        )?;
        rows.iter().map(row_to_site).collect()
    }

    fn find_site(&self, site_id: &str) -> Result<Option<Site>, StorageError> {
        let row = self.client().query_opt(
            &format!("SELECT {} FROM rockfall_sites WHERE site_id = $1", SITE_COLUMNS),
            &[&site_id],
        )?;
        row.as_ref().map(row_to_site).transpose()
    }

    fn upsert_site(&self, site: &Site) -> Result<(), StorageError> {
        self.client().execute(
            "INSERT INTO rockfall_sites
                 (site_id, name, latitude, longitude, elevation_m, is_active, emails, phones)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             ON CONFLICT (site_id) DO UPDATE SET
                 name = EXCLUDED.name,
                 latitude = EXCLUDED.latitude,
                 longitude = EXCLUDED.longitude,
                 elevation_m = EXCLUDED.elevation_m,
                 is_active = EXCLUDED.is_active,
                 emails = EXCLUDED.emails,
                 phones = EXCLUDED.phones,
                 updated_at = NOW()",
            &[
                &site.id,
                &site.name,
                &site.location.latitude,
                &site.location.longitude,
                &site.location.elevation_m,
                &site.is_active,
                &site.contacts.emails,
                &site.contacts.phones,
            ],
        )?;
        Ok(())
    }

    fn latest_feature_snapshot(&self, site_id: &str) -> Result<Option<FeatureSnapshot>, StorageError> {
        let row = self.client().query_opt(
            "SELECT site_id, recorded_at, features FROM feature_snapshots
             WHERE site_id = $1
             ORDER BY recorded_at DESC, id DESC
             LIMIT 1",
            &[&site_id],
        )?;
        row.as_ref().map(row_to_snapshot).transpose()
    }

    fn recent_feature_history(&self, site_id: &str, limit: usize) -> Result<Vec<FeatureSnapshot>, StorageError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = self.client().query(
            "SELECT site_id, recorded_at, features FROM (
                 SELECT id, site_id, recorded_at, features FROM feature_snapshots
                 WHERE site_id = $1
                 ORDER BY recorded_at DESC, id DESC
                 LIMIT $2
             ) recent
             ORDER BY recorded_at ASC, id ASC",
            &[&site_id, &limit],
        )?;
        rows.iter().map(row_to_snapshot).collect()
    }

    fn append_feature_snapshot(&self, snapshot: &FeatureSnapshot) -> Result<(), StorageError> {
        let mut client = self.client();
        let mut tx = client.transaction()?;

        let latest: Option<DateTime<Utc>> = tx
            .query_one(
                "SELECT MAX(recorded_at) FROM feature_snapshots WHERE site_id = $1",
                &[&snapshot.site_id],
            )?
            .try_get(0)?;
        if let Some(latest) = latest.filter(|latest| snapshot.timestamp < *latest) {
            return Err(StorageError::OutOfOrderSnapshot {
                site_id: snapshot.site_id.clone(),
                timestamp: snapshot.timestamp,
                latest,
            });
        }

        tx.execute(
            "INSERT INTO feature_snapshots (site_id, recorded_at, features) VALUES ($1, $2, $3)",
            &[
                &snapshot.site_id,
                &snapshot.timestamp,
                &feature_values::to_json(&snapshot.features),
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn append_risk_assessment(&self, assessment: &RiskAssessment) -> Result<(), StorageError> {
        self.client().execute(
            &format!("INSERT INTO risk_assessments ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)", ASSESSMENT_COLUMNS),
            &[
                &assessment.id,
                &assessment.site_id,
                &assessment.timestamp,
                &assessment.probability,
                &assessment.tier.as_str(),
                &assessment.scorer,
                &feature_values::to_json(&assessment.features),
                &assessment.inference_ms,
            ],
        )?;
        Ok(())
    }

    fn latest_assessment(&self, site_id: &str) -> Result<Option<RiskAssessment>, StorageError> {
        let row = self.client().query_opt(
            &format!(
                "SELECT {} FROM risk_assessments WHERE site_id = $1 ORDER BY assessed_at DESC LIMIT 1",
                ASSESSMENT_COLUMNS
            ),
            &[&site_id],
        )?;
        row.as_ref().map(row_to_assessment).transpose()
    }

    fn assessment_history(&self, site_id: &str, range: TimeRange) -> Result<Vec<RiskAssessment>, StorageError> {
        let rows = self.client().query(
            &format!(
                "SELECT {} FROM risk_assessments
                 WHERE site_id = $1
                   AND ($2::timestamptz IS NULL OR assessed_at >= $2)
                   AND ($3::timestamptz IS NULL OR assessed_at <= $3)
                 ORDER BY assessed_at ASC",
                ASSESSMENT_COLUMNS
            ),
            &[&site_id, &range.start, &range.end],
        )?;
        rows.iter().map(row_to_assessment).collect()
    }

    fn append_alert_record(&self, record: &AlertRecord) -> Result<(), StorageError> {
        self.client().execute(
            &format!(
                "INSERT INTO alert_records ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
                ALERT_COLUMNS
            ),
            &[
                &record.id,
                &record.assessment_id,
                &record.site_id,
                &record.tier.as_str(),
                &record.status.as_str(),
                &channel_names(&record.channels),
                &deliveries_json(&record.deliveries)?,
                &record.error_message,
                &record.created_at,
                &record.sent_at,
            ],
        )?;
        Ok(())
    }

    fn update_alert_record_status(&self, id: Uuid, resolution: &AlertResolution) -> Result<AlertRecord, StorageError> {
        let mut client = self.client();
        let mut tx = client.transaction()?;

        let row = tx
            .query_opt(
                &format!("SELECT {} FROM alert_records WHERE alert_id = $1 FOR UPDATE", ALERT_COLUMNS),
                &[&id],
            )?
            .ok_or(StorageError::AlertNotFound(id))?;
        let mut record = row_to_alert(&row)?;
        record.resolve(resolution)?;

        tx.execute(
            "UPDATE alert_records
             SET status = $2, channels = $3, deliveries = $4, error_message = $5, sent_at = $6
             WHERE alert_id = $1",
            &[
                &record.id,
                &record.status.as_str(),
                &channel_names(&record.channels),
                &deliveries_json(&record.deliveries)?,
                &record.error_message,
                &record.sent_at,
            ],
        )?;
        tx.commit()?;
        Ok(record)
    }

    fn most_recent_alert(
        &self,
        site_id: &str,
        tier: RiskTier,
        since: DateTime<Utc>,
        statuses: &[AlertStatus],
    ) -> Result<Option<AlertRecord>, StorageError> {
        let statuses: Vec<&str> = statuses.iter().map(|s| s.as_str()).collect();
        let row = self.client().query_opt(
            &format!(
                "SELECT {} FROM alert_records
                 WHERE site_id = $1 AND tier = $2 AND created_at >= $3 AND status = ANY($4)
                 ORDER BY created_at DESC
                 LIMIT 1",
                ALERT_COLUMNS
            ),
            &[&site_id, &tier.as_str(), &since, &statuses],
        )?;
        row.as_ref().map(row_to_alert).transpose()
    }

    fn pending_alerts_created_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<AlertRecord>, StorageError> {
        let rows = self.client().query(
            &format!(
                "SELECT {} FROM alert_records WHERE status = 'PENDING' AND created_at < $1 ORDER BY created_at",
                ALERT_COLUMNS
            ),
            &[&cutoff],
        )?;
        rows.iter().map(row_to_alert).collect()
    }
}
