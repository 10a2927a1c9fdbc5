//! Email delivery through an HTTP transactional-mail API.
//!
//! The provider posts one JSON document per recipient:
//!
//! ```json
//! { "from": "...", "to": "...", "subject": "...", "text": "..." }
//! ```
//!
//! authenticated with a bearer token. Any 2xx response is a delivery.

use std::time::Duration;

use serde::Serialize;

use super::{AlertMessage, ChannelProvider};
use crate::config::EmailConfig;
use crate::error::ChannelError;
use crate::model::Channel;

#[derive(Debug, Serialize)]
struct MailRequest<'a> {
    from: &'a str,
    to: &'a str,
    subject: &'a str,
    text: &'a str,
}

pub struct HttpEmailProvider {
    client: reqwest::blocking::Client,
    endpoint: String,
    from: String,
    api_key: String,
}

impl HttpEmailProvider {
    pub fn new(config: &EmailConfig, api_key: &str, timeout: Duration) -> Result<Self, ChannelError> {
        let client = reqwest::blocking::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            from: config.from.clone(),
            api_key: api_key.to_string(),
        })
    }
}

/// Minimal shape check: one `@` with something on both sides and a dot in
/// the domain.
pub fn is_valid_address(address: &str) -> bool {
    match address.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty() && !domain.contains('@') && domain.contains('.') && !domain.starts_with('.')
        }
        None => false,
    }
}

impl ChannelProvider for HttpEmailProvider {
    fn channel(&self) -> Channel {
        Channel::Email
    }

    fn name(&self) -> &str {
        "http-mail"
    }

    fn send(&self, recipient: &str, message: &AlertMessage) -> Result<(), ChannelError> {
        if !is_valid_address(recipient) {
            return Err(ChannelError::InvalidRecipient {
                channel: Channel::Email,
                recipient: recipient.to_string(),
            });
        }

        let request = MailRequest {
            from: &self.from,
            to: recipient,
            subject: &message.email_subject,
            text: &message.email_body,
        };
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = response.text().unwrap_or_default();
            Err(ChannelError::Rejected {
                status: status.as_u16(),
                body: body.chars().take(200).collect(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_validation() {
        assert!(is_valid_address("ops@example.org"));
        assert!(is_valid_address("geo.team+alerts@canton.example.ch"));
        assert!(!is_valid_address("ops.example.org"));
        assert!(!is_valid_address("@example.org"));
        assert!(!is_valid_address("ops@localhost"));
        assert!(!is_valid_address("a@b@example.org"));
    }

    #[test]
    fn test_invalid_recipient_rejected_before_any_request() {
        // Unroutable endpoint: reaching the network would be a Transport error.
        let config = EmailConfig {
            endpoint: "http://127.0.0.1:9/send".into(),
            from: "alerts@example.org".into(),
        };
        let provider = HttpEmailProvider::new(&config, "key", Duration::from_millis(200)).unwrap();
        let message = AlertMessage {
            email_subject: "s".into(),
            email_body: "b".into(),
            sms_text: "t".into(),
        };
        let err = provider.send("not-an-address", &message).unwrap_err();
        assert!(matches!(err, ChannelError::InvalidRecipient { channel: Channel::Email, .. }));
    }

    #[test]
    fn test_request_serializes_expected_fields() {
        let request = MailRequest {
            from: "alerts@example.org",
            to: "ops@example.org",
            subject: "Rockfall Alert",
            text: "body",
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["to"], "ops@example.org");
        assert_eq!(json["subject"], "Rockfall Alert");
        assert_eq!(json["text"], "body");
    }
}
