//! Shared fixtures for the integration tests: sites, snapshots and a
//! channel provider that records what it was asked to send.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeZone, Utc};

use rockfall_service::config::Settings;
use rockfall_service::error::ChannelError;
use rockfall_service::model::{
    Channel, Contacts, FeatureSnapshot, HUMIDITY, Location, MAX_MAGNITUDE, MINUTES_SINCE_M3, QUAKE_COUNT, RAIN_1H,
    RAIN_24H, RAIN_72H, Site, TEMPERATURE, WEIGHTED_MAGNITUDE,
};
use rockfall_service::notify::{AlertMessage, ChannelProvider, NotificationDispatcher};
use rockfall_service::pipeline::SiteEvaluator;
use rockfall_service::storage::{MemoryStore, Storage};

/// 2024-05-01 13:00:00 UTC
pub fn fixed_now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 13, 0, 0).unwrap()
}

pub fn site(id: &str, emails: &[&str], phones: &[&str]) -> Site {
    Site {
        id: id.to_string(),
        name: format!("Test slope {}", id),
        location: Location {
            latitude: 46.59,
            longitude: 7.91,
            elevation_m: Some(1200.0),
        },
        is_active: true,
        contacts: Contacts {
            emails: emails.iter().map(|s| s.to_string()).collect(),
            phones: phones.iter().map(|s| s.to_string()).collect(),
        },
    }
}

/// A complete snapshot, seismic features included.
pub fn snapshot(site_id: &str, at: DateTime<Utc>, rain_24h: f64, rain_72h: f64, magnitude: f64, humidity: f64) -> FeatureSnapshot {
    FeatureSnapshot::new(site_id, at)
        .with(RAIN_1H, 0.0)
        .with(RAIN_24H, rain_24h)
        .with(RAIN_72H, rain_72h)
        .with(TEMPERATURE, 8.0)
        .with(HUMIDITY, humidity)
        .with(QUAKE_COUNT, if magnitude > 0.0 { 1.0 } else { 0.0 })
        .with(MAX_MAGNITUDE, magnitude)
        .with(WEIGHTED_MAGNITUDE, magnitude * 0.1)
        .with(MINUTES_SINCE_M3, f64::INFINITY)
}

// ---------------------------------------------------------------------------
// Recording provider
// ---------------------------------------------------------------------------

/// Succeeds for every recipient except those listed in `reject`.
pub struct RecordingProvider {
    channel: Channel,
    reject: Vec<String>,
    pub sent: Arc<Mutex<Vec<String>>>,
}

impl RecordingProvider {
    pub fn new(channel: Channel) -> Self {
        Self {
            channel,
            reject: Vec::new(),
            sent: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn rejecting(channel: Channel, reject: &[&str]) -> Self {
        Self {
            reject: reject.iter().map(|s| s.to_string()).collect(),
            ..Self::new(channel)
        }
    }
}

impl ChannelProvider for RecordingProvider {
    fn channel(&self) -> Channel {
        self.channel
    }

    fn name(&self) -> &str {
        "recording"
    }

    fn send(&self, recipient: &str, _: &AlertMessage) -> Result<(), ChannelError> {
        if self.reject.iter().any(|r| r == recipient) {
            return Err(ChannelError::Rejected {
                status: 400,
                body: format!("unreachable recipient {}", recipient),
            });
        }
        self.sent.lock().unwrap().push(recipient.to_string());
        Ok(())
    }
}

/// Email and SMS both delivered, with handles on what was sent.
pub fn recording_dispatcher() -> (NotificationDispatcher, Arc<Mutex<Vec<String>>>, Arc<Mutex<Vec<String>>>) {
    let email = RecordingProvider::new(Channel::Email);
    let sms = RecordingProvider::new(Channel::Sms);
    let (emails, texts) = (email.sent.clone(), sms.sent.clone());
    let dispatcher = NotificationDispatcher::new()
        .with_provider(Box::new(email))
        .with_provider(Box::new(sms));
    (dispatcher, emails, texts)
}

pub fn evaluator(store: &Arc<MemoryStore>, dispatcher: NotificationDispatcher) -> SiteEvaluator {
    let storage: Arc<dyn Storage> = store.clone();
    SiteEvaluator::new(storage, &Settings::default(), dispatcher)
}
