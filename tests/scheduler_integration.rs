/// Integration tests for the evaluation scheduler
///
/// Each test drives `run_cycle` directly with a fixed clock, so no timers are
/// involved. Data sources are in-process fakes; only the worker-limit test
/// sleeps, briefly, inside its fake.
///
/// Run with: cargo test --test scheduler_integration

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};

use common::{evaluator, fixed_now, recording_dispatcher, site, snapshot};
use rockfall_service::config::SchedulerConfig;
use rockfall_service::error::DataSourceError;
use rockfall_service::ingest::{FeatureCollector, SeismicSource, WeatherObservation, WeatherSource};
use rockfall_service::model::{
    AlertRecord, AlertStatus, Location, RAIN_24H, RiskAssessment, RiskTier, SeismicEvent, Site,
};
use rockfall_service::scheduler::SiteEvaluationScheduler;
use rockfall_service::storage::{MemoryStore, Storage};

// ============================================================================
// Test Helpers
// ============================================================================

fn site_at(id: &str, latitude: f64) -> Site {
    let mut site = site(id, &["duty@example.org"], &[]);
    site.location = Location {
        latitude,
        longitude: 7.9,
        elevation_m: None,
    };
    site
}

fn config(worker_limit: usize) -> SchedulerConfig {
    SchedulerConfig {
        worker_limit,
        ..SchedulerConfig::default()
    }
}

/// Panics for sites north of `panic_above`, otherwise reports no events.
struct TrippingSeismic {
    panic_above: f64,
}

impl SeismicSource for TrippingSeismic {
    fn events_near(
        &self,
        location: &Location,
        _: DateTime<Utc>,
        _: DateTime<Utc>,
    ) -> Result<Vec<SeismicEvent>, DataSourceError> {
        if location.latitude > self.panic_above {
            panic!("seismic feed exploded");
        }
        Ok(Vec::new())
    }
}

/// Records how many calls overlap. Each call holds for a few milliseconds
/// so that workers running together are actually seen together.
#[derive(Default)]
struct ConcurrencyGauge {
    current: AtomicUsize,
    peak: AtomicUsize,
    calls: AtomicUsize,
}

struct GaugedSeismic {
    gauge: Arc<ConcurrencyGauge>,
}

impl SeismicSource for GaugedSeismic {
    fn events_near(
        &self,
        _: &Location,
        _: DateTime<Utc>,
        _: DateTime<Utc>,
    ) -> Result<Vec<SeismicEvent>, DataSourceError> {
        let running = self.gauge.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.gauge.peak.fetch_max(running, Ordering::SeqCst);
        thread::sleep(StdDuration::from_millis(20));
        self.gauge.current.fetch_sub(1, Ordering::SeqCst);
        self.gauge.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Vec::new())
    }
}

fn pending_high(store: &MemoryStore, site_id: &str, created_at: DateTime<Utc>) -> AlertRecord {
    let assessment = RiskAssessment {
        id: uuid::Uuid::new_v4(),
        site_id: site_id.to_string(),
        timestamp: created_at,
        probability: 0.8,
        tier: RiskTier::High,
        scorer: "rule-based".to_string(),
        features: Default::default(),
        inference_ms: 0.1,
    };
    store.append_risk_assessment(&assessment).unwrap();
    let record = AlertRecord::pending(assessment.id, site_id, RiskTier::High, created_at);
    store.append_alert_record(&record).unwrap();
    record
}

struct CountingWeather {
    calls: Arc<AtomicUsize>,
}

impl WeatherSource for CountingWeather {
    fn current(&self, _: &Location) -> Result<WeatherObservation, DataSourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(WeatherObservation {
            observed_at: fixed_now(),
            temperature_c: 6.5,
            humidity_pct: 60.0,
            rain_1h_mm: 2.0,
        })
    }
}

// ============================================================================
// Cycle behaviour
// ============================================================================

#[test]
fn test_panicking_site_does_not_stop_the_cycle() {
    let store = Arc::new(MemoryStore::with_sites([
        site_at("north", 47.5),
        site_at("south-1", 46.0),
        site_at("south-2", 45.9),
    ]));
    for id in ["north", "south-1", "south-2"] {
        store
            .append_feature_snapshot(&snapshot(id, fixed_now(), 0.0, 0.0, 0.0, 40.0))
            .unwrap();
    }
    let (dispatcher, _, _) = recording_dispatcher();
    let evaluator =
        Arc::new(evaluator(&store, dispatcher).with_seismic_source(Box::new(TrippingSeismic { panic_above: 47.0 })));
    let scheduler = SiteEvaluationScheduler::new(evaluator, config(2)).unwrap();

    let summary = scheduler.run_cycle(fixed_now());
    assert_eq!(summary.total, 3);
    assert_eq!(summary.evaluated, 2);
    assert_eq!(summary.failed, 1);
    assert!(store.latest_assessment("south-1").unwrap().is_some());
    assert!(store.latest_assessment("south-2").unwrap().is_some());
    assert!(store.latest_assessment("north").unwrap().is_none());

    // The site lock survives the panic; the next cycle still reaches the site.
    let again = scheduler.run_cycle(fixed_now() + Duration::minutes(5));
    assert_eq!(again.failed, 1);
    assert_eq!(again.evaluated, 2);
}

#[test]
fn test_failures_are_counted_per_site() {
    let store = Arc::new(MemoryStore::with_sites([site_at("fresh", 46.0), site_at("empty", 46.1)]));
    store
        .append_feature_snapshot(&snapshot("fresh", fixed_now(), 30.0, 60.0, 0.0, 50.0))
        .unwrap();
    let (dispatcher, emails, _) = recording_dispatcher();
    let scheduler = SiteEvaluationScheduler::new(Arc::new(evaluator(&store, dispatcher)), config(4)).unwrap();

    let summary = scheduler.run_cycle(fixed_now());
    assert_eq!(summary.evaluated, 1);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.alerts_dispatched, 1);
    assert_eq!(emails.lock().unwrap().len(), 1);

    let next = scheduler.run_cycle(fixed_now() + Duration::minutes(5));
    assert_eq!(next.alerts_dispatched, 0);
    assert_eq!(next.alerts_suppressed, 1);
}

#[test]
fn test_inactive_sites_are_not_evaluated() {
    let mut retired = site_at("retired", 46.2);
    retired.is_active = false;
    let store = Arc::new(MemoryStore::with_sites([site_at("live", 46.0), retired]));
    for id in ["live", "retired"] {
        store
            .append_feature_snapshot(&snapshot(id, fixed_now(), 0.0, 0.0, 0.0, 40.0))
            .unwrap();
    }
    let (dispatcher, _, _) = recording_dispatcher();
    let scheduler = SiteEvaluationScheduler::new(Arc::new(evaluator(&store, dispatcher)), config(1)).unwrap();

    let summary = scheduler.run_cycle(fixed_now());
    assert_eq!(summary.total, 1);
    assert!(store.latest_assessment("retired").unwrap().is_none());
}

#[test]
fn test_shutdown_skips_remaining_sites() {
    let store = Arc::new(MemoryStore::with_sites([site_at("a", 46.0), site_at("b", 46.1)]));
    for id in ["a", "b"] {
        store
            .append_feature_snapshot(&snapshot(id, fixed_now(), 0.0, 0.0, 0.0, 40.0))
            .unwrap();
    }
    let (dispatcher, _, _) = recording_dispatcher();
    let scheduler = SiteEvaluationScheduler::new(Arc::new(evaluator(&store, dispatcher)), config(2)).unwrap();
    let handle = scheduler.shutdown_handle();

    handle.shutdown();
    assert!(handle.is_shutdown());

    let summary = scheduler.run_cycle(fixed_now());
    assert_eq!(summary.total, 2);
    assert_eq!(summary.skipped, 2);
    assert_eq!(summary.evaluated, 0);
    assert!(store.latest_assessment("a").unwrap().is_none());

    // With shutdown already requested, run() returns without blocking.
    scheduler.run();
}

#[test]
fn test_worker_limit_bounds_concurrent_sites() {
    let ids: Vec<String> = (0..8).map(|i| format!("slope-{}", i)).collect();
    let store = Arc::new(MemoryStore::with_sites(
        ids.iter().enumerate().map(|(i, id)| site_at(id, 46.0 + i as f64 * 0.01)),
    ));
    for id in &ids {
        store
            .append_feature_snapshot(&snapshot(id, fixed_now(), 0.0, 0.0, 0.0, 40.0))
            .unwrap();
    }
    let gauge = Arc::new(ConcurrencyGauge::default());
    let (dispatcher, _, _) = recording_dispatcher();
    let evaluator =
        Arc::new(evaluator(&store, dispatcher).with_seismic_source(Box::new(GaugedSeismic { gauge: gauge.clone() })));
    let scheduler = SiteEvaluationScheduler::new(evaluator, config(2)).unwrap();

    let summary = scheduler.run_cycle(fixed_now());
    assert_eq!(summary.evaluated, 8);
    assert_eq!(gauge.calls.load(Ordering::SeqCst), 8);
    let peak = gauge.peak.load(Ordering::SeqCst);
    assert!(peak <= 2, "{} sites evaluated at once with a limit of 2", peak);
    assert!(peak >= 1);
}

#[test]
fn test_shutdown_resolves_leftover_pending_alerts() {
    let store = Arc::new(MemoryStore::with_sites([site_at("a", 46.0)]));
    let leftover = pending_high(&store, "a", fixed_now() - Duration::minutes(1));

    let (dispatcher, _, _) = recording_dispatcher();
    let scheduler = SiteEvaluationScheduler::new(Arc::new(evaluator(&store, dispatcher)), config(1)).unwrap();
    scheduler.shutdown_handle().shutdown();
    scheduler.run();

    let records = store.alert_records();
    assert_eq!(records[0].id, leftover.id);
    assert_eq!(records[0].status, AlertStatus::Error);
    assert_eq!(scheduler.resolve_abandoned_alerts(fixed_now()), 0, "already resolved");
}

#[test]
fn test_zero_worker_limit_is_rejected() {
    let store = Arc::new(MemoryStore::new());
    let (dispatcher, _, _) = recording_dispatcher();
    let result = SiteEvaluationScheduler::new(Arc::new(evaluator(&store, dispatcher)), config(0));
    assert!(result.is_err());
}

// ============================================================================
// Reconciliation and collection
// ============================================================================

#[test]
fn test_orphaned_pending_alert_is_reconciled() {
    let store = Arc::new(MemoryStore::with_sites([site_at("a", 46.0)]));
    let orphan = pending_high(&store, "a", fixed_now() - Duration::hours(2));

    let (dispatcher, _, _) = recording_dispatcher();
    let scheduler = SiteEvaluationScheduler::new(Arc::new(evaluator(&store, dispatcher)), config(1)).unwrap();
    let summary = scheduler.run_cycle(fixed_now());

    assert_eq!(summary.reconciled, 1);
    let records = store.alert_records();
    assert_eq!(records[0].id, orphan.id);
    assert_eq!(records[0].status, AlertStatus::Error);
    assert!(records[0].error_message.is_some());
}

#[test]
fn test_abandoned_pending_does_not_hold_the_window() {
    // A PENDING record left by a crashed evaluation three minutes ago. The
    // sweep has not reached it yet, but it is past the in-flight bound.
    let store = Arc::new(MemoryStore::with_sites([site_at("a", 46.0)]));
    store
        .append_feature_snapshot(&snapshot("a", fixed_now(), 30.0, 60.0, 0.0, 50.0))
        .unwrap();
    let orphan = pending_high(&store, "a", fixed_now() - Duration::minutes(3));

    let (dispatcher, emails, _) = recording_dispatcher();
    let scheduler = SiteEvaluationScheduler::new(Arc::new(evaluator(&store, dispatcher)), config(1)).unwrap();

    let first = scheduler.run_cycle(fixed_now());
    assert_eq!(first.reconciled, 0);
    assert_eq!(first.alerts_dispatched, 1);
    assert_eq!(emails.lock().unwrap().len(), 1);

    // The delivered alert holds the window; the sweep now retires the orphan.
    let second = scheduler.run_cycle(fixed_now() + Duration::minutes(5));
    assert_eq!(second.reconciled, 1);
    assert_eq!(second.alerts_suppressed, 1);

    let third = scheduler.run_cycle(fixed_now() + Duration::minutes(10));
    assert_eq!(third.alerts_suppressed, 1);
    assert_eq!(emails.lock().unwrap().len(), 1);

    let records = store.alert_records();
    let orphan_status = records.iter().find(|r| r.id == orphan.id).map(|r| r.status);
    assert_eq!(orphan_status, Some(AlertStatus::Error));
    assert_eq!(records.iter().filter(|r| r.status == AlertStatus::Sent).count(), 1);
}

#[test]
fn test_collector_fills_missing_snapshots_before_evaluation() {
    let store = Arc::new(MemoryStore::with_sites([site_at("a", 46.0)]));
    let calls = Arc::new(AtomicUsize::new(0));
    let storage: Arc<dyn Storage> = store.clone();
    let collector = FeatureCollector::new(storage, Box::new(CountingWeather { calls: calls.clone() }));

    let (dispatcher, _, _) = recording_dispatcher();
    let scheduler = SiteEvaluationScheduler::new(Arc::new(evaluator(&store, dispatcher)), config(1))
        .unwrap()
        .with_collector(collector);

    let summary = scheduler.run_cycle(fixed_now());
    assert_eq!(summary.collected, 1);
    assert_eq!(summary.evaluated, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let stored = store.latest_feature_snapshot("a").unwrap().unwrap();
    assert_eq!(stored.get(RAIN_24H), Some(2.0));
    let assessment = store.latest_assessment("a").unwrap().unwrap();
    assert_eq!(assessment.tier, RiskTier::Low);

    // Ten minutes later the snapshot is still fresh; no second weather call.
    let next = scheduler.run_cycle(fixed_now() + Duration::minutes(10));
    assert_eq!(next.collected, 0);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}
