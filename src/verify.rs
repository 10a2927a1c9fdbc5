//! Preflight verification.
//!
//! Checks every active site against the live configuration before the
//! scheduler is trusted with it: does it have anyone to notify, is its
//! feature data fresh, and do the weather and seismic providers answer for
//! its coordinates.
//!
//! Run with `--verify`; nothing is written to storage.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::alert::stalenesses::{is_snapshot_stale_at, snapshot_age_minutes};
use crate::error::StorageError;
use crate::ingest::{SeismicSource, WeatherSource};
use crate::model::Site;
use crate::storage::Storage;

// ============================================================================
// Verification Results
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct VerificationReport {
    pub timestamp: String,
    pub sites: Vec<SiteVerification>,
    pub summary: VerificationSummary,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct VerificationSummary {
    pub total: usize,
    pub ready: usize,
    pub degraded: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SiteVerification {
    pub site_id: String,
    pub name: String,
    pub status: VerificationStatus,
    pub contacts_configured: bool,
    /// `None` when the site has no snapshot at all.
    pub snapshot_age_minutes: Option<i64>,
    /// `None` when no provider is configured.
    pub weather_reachable: Option<bool>,
    pub seismic_reachable: Option<bool>,
    pub problems: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub enum VerificationStatus {
    Success,
    /// Usable, but evaluations may fail or fall back until fixed.
    PartialSuccess,
    /// Alerts for this site cannot be delivered.
    Failed,
}

/// The live providers to check. Either may be absent.
#[derive(Default, Clone, Copy)]
pub struct LiveSources<'a> {
    pub weather: Option<&'a dyn WeatherSource>,
    pub seismic: Option<&'a dyn SeismicSource>,
}

// ============================================================================
// Per-site Verification
// ============================================================================

pub fn verify_site(
    storage: &dyn Storage,
    site: &Site,
    sources: LiveSources<'_>,
    max_snapshot_age: Duration,
    now: DateTime<Utc>,
) -> Result<SiteVerification, StorageError> {
    let mut failures = Vec::new();
    let mut warnings = Vec::new();

    let contacts_configured = !site.contacts.is_empty();
    if !contacts_configured {
        failures.push("no contacts configured".to_string());
    }

    let latest = storage.latest_feature_snapshot(&site.id)?;
    let snapshot_age = latest.as_ref().map(|snapshot| snapshot_age_minutes(snapshot, now));
    match (&latest, snapshot_age) {
        (Some(snapshot), Some(age)) if is_snapshot_stale_at(snapshot, max_snapshot_age, now) => {
            warnings.push(format!("latest snapshot is {} minutes old", age))
        }
        (None, _) => warnings.push("no feature snapshots stored".to_string()),
        _ => {}
    }

    let weather_reachable = sources.weather.map(|weather| match weather.current(&site.location) {
        Ok(_) => true,
        Err(e) => {
            failures.push(format!("weather: {}", e));
            false
        }
    });

    let seismic_reachable = sources.seismic.map(|seismic| {
        match seismic.events_near(&site.location, now - Duration::hours(1), now) {
            Ok(_) => true,
            Err(e) => {
                // Seismic features fail open, so this only degrades the site.
                warnings.push(format!("seismic: {}", e));
                false
            }
        }
    });

    let status = if !failures.is_empty() {
        VerificationStatus::Failed
    } else if !warnings.is_empty() {
        VerificationStatus::PartialSuccess
    } else {
        VerificationStatus::Success
    };
    failures.extend(warnings);

    Ok(SiteVerification {
        site_id: site.id.clone(),
        name: site.name.clone(),
        status,
        contacts_configured,
        snapshot_age_minutes: snapshot_age,
        weather_reachable,
        seismic_reachable,
        problems: failures,
    })
}

// ============================================================================
// Full Verification Runner
// ============================================================================

pub fn run_verification(
    storage: &dyn Storage,
    sources: LiveSources<'_>,
    max_snapshot_age: Duration,
    now: DateTime<Utc>,
) -> Result<VerificationReport, StorageError> {
    let mut report = VerificationReport {
        timestamp: now.to_rfc3339(),
        sites: Vec::new(),
        summary: VerificationSummary::default(),
    };

    for site in storage.active_sites()? {
        let result = verify_site(storage, &site, sources, max_snapshot_age, now)?;
        report.summary.total += 1;
        match result.status {
            VerificationStatus::Success => report.summary.ready += 1,
            VerificationStatus::PartialSuccess => report.summary.degraded += 1,
            VerificationStatus::Failed => report.summary.failed += 1,
        }
        report.sites.push(result);
    }

    Ok(report)
}

pub fn print_summary(report: &VerificationReport) {
    println!("\n═══════════════════════════════════════════════════════════");
    println!("PREFLIGHT VERIFICATION ({})", report.timestamp);
    println!("═══════════════════════════════════════════════════════════");

    for site in &report.sites {
        let marker = match site.status {
            VerificationStatus::Success => "✓",
            VerificationStatus::PartialSuccess => "⚠",
            VerificationStatus::Failed => "✗",
        };
        let age = site
            .snapshot_age_minutes
            .map(|m| format!("{} min", m))
            .unwrap_or_else(|| "none".to_string());
        println!("  {} {} ({})  latest snapshot: {}", marker, site.name, site.site_id, age);
        for problem in &site.problems {
            println!("      - {}", problem);
        }
    }

    println!();
    println!(
        "Sites: {} ready, {} degraded, {} failed (of {})",
        report.summary.ready, report.summary.degraded, report.summary.failed, report.summary.total
    );
    println!("═══════════════════════════════════════════════════════════");
}
