//! Multi-channel alert delivery.
//!
//! The dispatcher fans one formatted alert out to every recipient of every
//! channel. Each channel-recipient pair is attempted independently; a
//! failure (including a provider panic) is recorded on that attempt and the
//! rest carry on. The attempts are then folded into the alert's terminal
//! status:
//!
//!   every attempt succeeded (and there was at least one)  →  SENT
//!   some, but not all, succeeded                          →  PARTIAL
//!   none succeeded, or nothing was attempted              →  ERROR

pub mod email;
pub mod sms;

use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};

use chrono::{DateTime, Utc};

use crate::error::ChannelError;
use crate::logging::Source;
use crate::model::{AlertResolution, AlertStatus, Channel, Contacts, DeliveryAttempt, RiskAssessment, Site};

pub use email::HttpEmailProvider;
pub use sms::TwilioSmsProvider;

// ---------------------------------------------------------------------------
// Message formatting
// ---------------------------------------------------------------------------

/// The content of one alert, pre-rendered for every channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertMessage {
    pub email_subject: String,
    pub email_body: String,
    pub sms_text: String,
}

impl AlertMessage {
    pub fn format(site: &Site, assessment: &RiskAssessment) -> Self {
        let probability = format!("{:.1}%", assessment.probability * 100.0);
        let timestamp = assessment.timestamp.to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
        let elevation = site
            .location
            .elevation_m
            .map(|e| format!("{:.0} m", e))
            .unwrap_or_else(|| "unknown".to_string());

        let email_subject = format!("Rockfall Alert: {} Risk at {}", assessment.tier, site.name);
        let email_body = format!(
            "Rockfall Alert\n\
             \n\
             Site: {name} ({id})\n\
             Risk Level: {tier}\n\
             Probability: {probability}\n\
             Assessed: {timestamp}\n\
             Scorer: {scorer}\n\
             \n\
             Location:\n\
             - Latitude: {lat:.5}\n\
             - Longitude: {lon:.5}\n\
             - Elevation: {elevation}\n\
             \n\
             Please take appropriate precautions and monitor the situation.\n",
            name = site.name,
            id = site.id,
            tier = assessment.tier,
            probability = probability,
            timestamp = timestamp,
            scorer = assessment.scorer,
            lat = site.location.latitude,
            lon = site.location.longitude,
            elevation = elevation,
        );
        let sms_text = format!(
            "ALERT: {} rockfall risk ({}) at {}. Check email for details.",
            assessment.tier, probability, site.name
        );

        Self {
            email_subject,
            email_body,
            sms_text,
        }
    }
}

// ---------------------------------------------------------------------------
// Providers
// ---------------------------------------------------------------------------

/// Delivers messages on one channel.
pub trait ChannelProvider: Send + Sync {
    fn channel(&self) -> Channel;

    /// Short provider name for logs.
    fn name(&self) -> &str;

    fn send(&self, recipient: &str, message: &AlertMessage) -> Result<(), ChannelError>;
}

/// Logs the message instead of sending it. Used by `--dry-run`.
#[derive(Debug, Clone, Copy)]
pub struct LogOnlyProvider {
    pub channel: Channel,
}

impl ChannelProvider for LogOnlyProvider {
    fn channel(&self) -> Channel {
        self.channel
    }

    fn name(&self) -> &str {
        "log-only"
    }

    fn send(&self, recipient: &str, message: &AlertMessage) -> Result<(), ChannelError> {
        let text = match self.channel {
            Channel::Email => &message.email_subject,
            Channel::Sms => &message.sms_text,
        };
        tracing::info!(source = %Source::Dispatch, channel = %self.channel, recipient, "dry run: {}", text);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Delivery report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryReport {
    pub attempts: Vec<DeliveryAttempt>,
    pub completed_at: DateTime<Utc>,
}

impl DeliveryReport {
    pub fn status(&self) -> AlertStatus {
        let succeeded = self.attempts.iter().filter(|a| a.success).count();
        if succeeded == 0 {
            AlertStatus::Error
        } else if succeeded == self.attempts.len() {
            AlertStatus::Sent
        } else {
            AlertStatus::Partial
        }
    }

    /// Channels with at least one attempt, in a stable order.
    pub fn channels(&self) -> Vec<Channel> {
        let mut channels: Vec<Channel> = self.attempts.iter().map(|a| a.channel).collect();
        channels.sort();
        channels.dedup();
        channels
    }

    /// `"<channel> to <recipient>: <error>"` for the first failed attempt.
    pub fn first_error(&self) -> Option<String> {
        if self.attempts.is_empty() {
            return Some("no recipients configured".to_string());
        }
        self.attempts.iter().find(|a| !a.success).map(|a| {
            format!(
                "{} to {}: {}",
                a.channel,
                a.recipient,
                a.error.as_deref().unwrap_or("unknown error")
            )
        })
    }

    pub fn into_resolution(self) -> AlertResolution {
        let status = self.status();
        AlertResolution {
            status,
            channels: self.channels(),
            error_message: self.first_error(),
            sent_at: (status != AlertStatus::Error).then_some(self.completed_at),
            deliveries: self.attempts,
        }
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct NotificationDispatcher {
    providers: BTreeMap<Channel, Box<dyn ChannelProvider>>,
}

impl NotificationDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a provider, replacing any earlier one for the same channel.
    pub fn register(&mut self, provider: Box<dyn ChannelProvider>) {
        self.providers.insert(provider.channel(), provider);
    }

    pub fn with_provider(mut self, provider: Box<dyn ChannelProvider>) -> Self {
        self.register(provider);
        self
    }

    pub fn has_provider(&self, channel: Channel) -> bool {
        self.providers.contains_key(&channel)
    }

    /// Sends `message` to every recipient in `contacts`.
    ///
    /// Never fails as a whole; per-attempt failures are in the report.
    pub fn dispatch(&self, site_id: &str, contacts: &Contacts, message: &AlertMessage, now: DateTime<Utc>) -> DeliveryReport {
        let mut attempts = Vec::new();

        for channel in Channel::ALL {
            for recipient in contacts.recipients(channel) {
                let result = match self.providers.get(&channel) {
                    Some(provider) => send_caught(provider.as_ref(), recipient, message),
                    None => Err(ChannelError::NotConfigured(channel)),
                };

                match &result {
                    Ok(()) => tracing::debug!(
                        source = %Source::Dispatch, site_id, channel = %channel, recipient, "delivered"
                    ),
                    Err(e) => tracing::warn!(
                        source = %Source::Dispatch, site_id, channel = %channel, recipient, error = %e,
                        "delivery failed"
                    ),
                }

                attempts.push(DeliveryAttempt {
                    channel,
                    recipient: recipient.to_string(),
                    success: result.is_ok(),
                    error: result.err().map(|e| e.to_string()),
                });
            }
        }

        DeliveryReport {
            attempts,
            completed_at: now,
        }
    }
}

impl std::fmt::Debug for NotificationDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.providers.values().map(|p| p.name()).collect();
        f.debug_struct("NotificationDispatcher").field("providers", &names).finish()
    }
}

fn send_caught(provider: &dyn ChannelProvider, recipient: &str, message: &AlertMessage) -> Result<(), ChannelError> {
    catch_unwind(AssertUnwindSafe(|| provider.send(recipient, message)))
        .unwrap_or_else(|_| Err(ChannelError::Transport(format!("{} provider panicked", provider.name()))))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
