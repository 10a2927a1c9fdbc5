//! SMS delivery through the Twilio REST API.
//!
//! `POST {api_base}/2010-04-01/Accounts/{sid}/Messages.json` with a form
//! body of `To`, `From` and `Body`, authenticated with HTTP basic auth
//! (account SID and auth token).

use std::time::Duration;

use super::{AlertMessage, ChannelProvider};
use crate::config::SmsConfig;
use crate::error::ChannelError;
use crate::model::Channel;

/// Twilio rejects bodies longer than this many characters.
const MAX_BODY_CHARS: usize = 1600;

pub struct TwilioSmsProvider {
    client: reqwest::blocking::Client,
    messages_url: String,
    account_sid: String,
    auth_token: String,
    from_number: String,
}

impl TwilioSmsProvider {
    pub fn new(
        config: &SmsConfig,
        account_sid: &str,
        auth_token: &str,
        timeout: Duration,
    ) -> Result<Self, ChannelError> {
        let client = reqwest::blocking::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            messages_url: messages_url(&config.api_base, account_sid),
            account_sid: account_sid.to_string(),
            auth_token: auth_token.to_string(),
            from_number: config.from_number.clone(),
        })
    }
}

fn messages_url(api_base: &str, account_sid: &str) -> String {
    format!(
        "{}/2010-04-01/Accounts/{}/Messages.json",
        api_base.trim_end_matches('/'),
        account_sid
    )
}

/// E.164: a `+`, then 8 to 15 digits.
pub fn is_valid_e164(number: &str) -> bool {
    match number.strip_prefix('+') {
        Some(digits) => (8..=15).contains(&digits.len()) && digits.chars().all(|c| c.is_ascii_digit()),
        None => false,
    }
}

impl ChannelProvider for TwilioSmsProvider {
    fn channel(&self) -> Channel {
        Channel::Sms
    }

    fn name(&self) -> &str {
        "twilio"
    }

    fn send(&self, recipient: &str, message: &AlertMessage) -> Result<(), ChannelError> {
        if !is_valid_e164(recipient) {
            return Err(ChannelError::InvalidRecipient {
                channel: Channel::Sms,
                recipient: recipient.to_string(),
            });
        }

        let body: String = message.sms_text.chars().take(MAX_BODY_CHARS).collect();
        let form = [
            ("To", recipient),
            ("From", self.from_number.as_str()),
            ("Body", body.as_str()),
        ];
        let response = self
            .client
            .post(&self.messages_url)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&form)
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
