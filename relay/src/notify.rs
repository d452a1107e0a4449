//! Notification rendering and hand-off.
//!
//! Handlers turn provider callbacks into a [`Notification`] and pass it to a
//! [`Mailer`]. Actual SMTP delivery lives behind that trait.

use std::net::SocketAddr;

use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

use crate::web::signature::FormFields;

/// A rendered message ready to be mailed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub subject: String,
    pub body: String,
    /// Client address the callback came from, as resolved by the proxy stage.
    pub remote_addr: String,
}

impl Notification {
    /// Value for an `X-Originating-IP` style header.
    pub fn originating_ip(&self) -> &str {
        originating_ip(&self.remote_addr)
    }
}

/// Strip a trailing port from an address if there is one.
pub fn originating_ip(remote_addr: &str) -> &str {
    match remote_addr.parse::<SocketAddr>() {
        Ok(_) => remote_addr
            .rsplit_once(':')
            .map(|(ip, _)| ip.trim_start_matches('[').trim_end_matches(']'))
            .unwrap_or(remote_addr),
        Err(_) => remote_addr,
    }
}

/// Remove CR and LF so caller-supplied text cannot inject mail headers.
pub fn strip_crlf(input: &str) -> String {
    input.chars().filter(|c| *c != '\r' && *c != '\n').collect()
}

/// Voice recording callback fields.
#[derive(Debug, Default)]
pub struct RecordingFinished {
    pub call_sid: String,
    pub from: String,
    pub from_city: String,
    pub from_state: String,
    pub from_country: String,
    pub to: String,
    pub to_city: String,
    pub to_state: String,
    pub to_country: String,
    pub recording_url: String,
}

impl From<&FormFields> for RecordingFinished {
    fn from(fields: &FormFields) -> Self {
        Self {
            call_sid: fields.get("CallSid").to_string(),
            from: fields.get("From").to_string(),
            from_city: fields.get("FromCity").to_string(),
            from_state: fields.get("FromState").to_string(),
            from_country: fields.get("FromCountry").to_string(),
            to: fields.get("To").to_string(),
            to_city: fields.get("ToCity").to_string(),
            to_state: fields.get("ToState").to_string(),
            to_country: fields.get("ToCountry").to_string(),
            recording_url: fields.get("RecordingUrl").to_string(),
        }
    }
}

/// Inbound SMS fields.
#[derive(Debug, Default)]
pub struct SmsReceived {
    pub from: String,
    pub to: String,
    pub body: String,
}

impl From<&FormFields> for SmsReceived {
    fn from(fields: &FormFields) -> Self {
        Self {
            from: fields.get("From").to_string(),
            to: fields.get("To").to_string(),
            body: fields.get("Body").to_string(),
        }
    }
}

fn place(city: &str, state: &str, country: &str) -> String {
    [city, state, country]
        .iter()
        .filter(|part| !part.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join(", ")
}

pub fn render_voicemail(call: &RecordingFinished, remote_addr: &str) -> Notification {
    let body = format!(
        "New voicemail\n\
         \n\
         From: {} ({})\n\
         To: {} ({})\n\
         Call SID: {}\n\
         \n\
         Recording: {}\n",
        call.from,
        place(&call.from_city, &call.from_state, &call.from_country),
        call.to,
        place(&call.to_city, &call.to_state, &call.to_country),
        call.call_sid,
        call.recording_url,
    );

    Notification {
        subject: format!("Voicemail from {}", strip_crlf(&call.from)),
        body,
        remote_addr: remote_addr.to_string(),
    }
}

pub fn render_sms(sms: &SmsReceived, remote_addr: &str) -> Notification {
    Notification {
        subject: format!("SMS from {}", strip_crlf(&sms.from)),
        body: format!("From: {}\nTo: {}\n\n{}\n", sms.from, sms.to, sms.body),
        remote_addr: remote_addr.to_string(),
    }
}

/// Delivers notifications.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, notification: Notification) -> Result<()>;
}

/// Mailer that only records the notification in the structured log.
#[derive(Debug, Default, Clone)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, notification: Notification) -> Result<()> {
        info!(
            subject = %notification.subject,
            originating_ip = %notification.originating_ip(),
            body_length = notification.body.len(),
            "notification_relayed"
        );
        Ok(())
    }
}
