/// Integration tests for the PostgreSQL storage backend
///
/// These tests verify:
/// 1. The bundled schema applies cleanly (and re-applies)
/// 2. Sites, snapshots and assessments round-trip through the database
/// 3. Alert records resolve exactly once
/// 4. The throttle and the pending sweep work against real queries
///
/// Prerequisites:
/// - PostgreSQL running and reachable
/// - DATABASE_URL set in .env
///
/// Run with: cargo test --test postgres_integration -- --ignored --test-threads=1

mod common;

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use postgres::{Client, NoTls};
use uuid::Uuid;

use common::{fixed_now, site, snapshot};
use rockfall_service::alert::stalenesses::reconcile_stale_pending;
use rockfall_service::alert::{AlertThrottle, Claim};
use rockfall_service::config::{Secrets, ThrottleConfig};
use rockfall_service::error::StorageError;
use rockfall_service::model::{
    AlertRecord, AlertResolution, AlertStatus, MINUTES_SINCE_M3, RAIN_72H, RiskAssessment, RiskTier, TimeRange,
};
use rockfall_service::storage::{PostgresStore, Storage};

// ---------------------------------------------------------------------------
// Test Helpers
// ---------------------------------------------------------------------------

fn database_url() -> String {
    Secrets::from_env()
        .database_url
        .unwrap_or_else(|| panic!("DATABASE_URL must be set to run postgres tests"))
}

fn get_test_store() -> PostgresStore {
    let store = PostgresStore::connect(&database_url(), StdDuration::from_secs(10)).unwrap_or_else(|e| {
        eprintln!("\n{}\n", "=".repeat(80));
        eprintln!("INTEGRATION TEST SETUP ERROR");
        eprintln!("{}", "=".repeat(80));
        eprintln!("\n{}\n", e);
        eprintln!("Check DATABASE_URL in .env and that PostgreSQL is running.\n");
        panic!("Database connection failed");
    });
    store.migrate().expect("schema should apply");
    store
}

/// Removes everything written for `site_id`, children first.
fn cleanup_site(site_id: &str) {
    let mut client = Client::connect(&database_url(), NoTls).expect("cleanup connection");
    for table in ["alert_records", "risk_assessments", "feature_snapshots", "rockfall_sites"] {
        client
            .execute(&format!("DELETE FROM {} WHERE site_id = $1", table), &[&site_id])
            .expect("cleanup delete");
    }
}

/// A site id no other test run will use.
fn unique_site_id() -> String {
    format!("pgtest-{}", Uuid::new_v4().simple())
}

fn assessment(site_id: &str, at: DateTime<Utc>, tier: RiskTier) -> RiskAssessment {
    RiskAssessment {
        id: Uuid::new_v4(),
        site_id: site_id.to_string(),
        timestamp: at,
        probability: 0.8,
        tier,
        scorer: "rule-based".to_string(),
        features: snapshot(site_id, at, 0.0, 60.0, 0.0, 50.0).features,
        inference_ms: 0.3,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[test]
#[ignore]
fn test_migrate_is_idempotent() {
    let store = get_test_store();
    store.migrate().expect("second migrate should be a no-op");
}

#[test]
#[ignore]
fn test_site_and_snapshot_round_trip() {
    let store = get_test_store();
    let id = unique_site_id();
    let mut s = site(&id, &["a@example.org"], &["+41790000000"]);
    store.upsert_site(&s).unwrap();

    s.name = "Renamed slope".to_string();
    store.upsert_site(&s).unwrap();
    assert_eq!(store.find_site(&id).unwrap(), Some(s));

    let first = snapshot(&id, fixed_now(), 1.0, 10.0, 0.0, 50.0);
    let second = snapshot(&id, fixed_now() + Duration::hours(1), 2.0, 20.0, 0.0, 55.0);
    store.append_feature_snapshot(&first).unwrap();
    store.append_feature_snapshot(&second).unwrap();

    let latest = store.latest_feature_snapshot(&id).unwrap().unwrap();
    assert_eq!(latest.get(RAIN_72H), Some(20.0));
    assert_eq!(latest.get(MINUTES_SINCE_M3), Some(f64::INFINITY));

    let history = store.recent_feature_history(&id, 10).unwrap();
    assert_eq!(history.len(), 2);
    assert!(history[0].timestamp < history[1].timestamp);

    let err = store.append_feature_snapshot(&first).unwrap_err();
    assert!(matches!(err, StorageError::OutOfOrderSnapshot { .. }), "got {:?}", err);

    cleanup_site(&id);
}

#[test]
#[ignore]
fn test_assessment_history_range() {
    let store = get_test_store();
    let id = unique_site_id();
    store.upsert_site(&site(&id, &["a@example.org"], &[])).unwrap();

    for h in 0..4 {
        store
            .append_risk_assessment(&assessment(&id, fixed_now() + Duration::hours(h), RiskTier::High))
            .unwrap();
    }
    let range = TimeRange::between(fixed_now() + Duration::hours(1), fixed_now() + Duration::hours(2));
    assert_eq!(store.assessment_history(&id, range).unwrap().len(), 2);
    assert_eq!(
        store.latest_assessment(&id).unwrap().unwrap().timestamp,
        fixed_now() + Duration::hours(3)
    );

    cleanup_site(&id);
}

#[test]
#[ignore]
fn test_alert_resolves_once_and_throttles() {
    let store: Arc<dyn Storage> = Arc::new(get_test_store());
    let id = unique_site_id();
    store.upsert_site(&site(&id, &["a@example.org"], &[])).unwrap();
    let a = assessment(&id, fixed_now(), RiskTier::High);
    store.append_risk_assessment(&a).unwrap();

    let throttle = AlertThrottle::new(store.clone(), ThrottleConfig::default());
    let Claim::Granted(pending) = throttle.try_claim(&id, RiskTier::High, a.id, fixed_now()).unwrap() else {
        panic!("first claim should be granted");
    };
    let alert_id = pending.record().id;

    // In flight: a second claim is suppressed by the PENDING record.
    let second = throttle
        .try_claim(&id, RiskTier::High, a.id, fixed_now() + Duration::minutes(1))
        .unwrap();
    assert!(matches!(second, Claim::Suppressed { .. }));

    let resolution = AlertResolution {
        status: AlertStatus::Sent,
        channels: vec![rockfall_service::model::Channel::Email],
        deliveries: Vec::new(),
        error_message: None,
        sent_at: Some(fixed_now()),
    };
    let record = pending.resolve(&resolution).unwrap();
    assert_eq!(record.status, AlertStatus::Sent);

    let err = store.update_alert_record_status(alert_id, &resolution).unwrap_err();
    assert!(matches!(err, StorageError::AlertAlreadyResolved { .. }));

    let after_window = throttle
        .try_claim(&id, RiskTier::High, a.id, fixed_now() + Duration::minutes(16))
        .unwrap();
    let Claim::Granted(next) = after_window else {
        panic!("window expired; claim should be granted");
    };
    next.resolve(&AlertResolution::failed("test teardown")).unwrap();

    cleanup_site(&id);
}

#[test]
#[ignore]
fn test_pending_sweep_against_database() {
    let store = get_test_store();
    let id = unique_site_id();
    store.upsert_site(&site(&id, &["a@example.org"], &[])).unwrap();
    let a = assessment(&id, fixed_now(), RiskTier::Medium);
    store.append_risk_assessment(&a).unwrap();

    let orphan = AlertRecord::pending(a.id, &id, RiskTier::Medium, fixed_now());
    store.append_alert_record(&orphan).unwrap();

    let resolved = reconcile_stale_pending(&store, Duration::minutes(30), fixed_now() + Duration::hours(1)).unwrap();
    assert!(resolved >= 1);

    let record = store
        .most_recent_alert(&id, RiskTier::Medium, fixed_now() - Duration::hours(1), &[AlertStatus::Error])
        .unwrap()
        .unwrap();
    assert_eq!(record.id, orphan.id);

    cleanup_site(&id);
}
