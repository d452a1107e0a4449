//! Webhook endpoint handlers.
//!
//! By the time a handler runs the request has passed the proxy and signature
//! stages. Handlers only render the notification, hand it off, and answer
//! Twilio with TwiML. Form values come from the [`FormFields`] the signature
//! stage parsed, first value per name.

use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Extension, Json,
};
use serde::Serialize;
use tracing::{error, info};

use crate::notify::{
    render_sms, render_voicemail, Mailer, Notification, RecordingFinished, SmsReceived,
};
use crate::web::proxy::ClientAddr;
use crate::web::signature::FormFields;
use crate::Config;

/// TwiML asking the caller to leave a message.
pub const RECORD_TWIML: &str = r##"<?xml version="1.0" encoding="UTF-8"?>
<Response>
    <Say>Please leave a message after the beep. Press the pound key when finished.</Say>
    <Record action="/record/finished.xml" method="POST" maxLength="120" finishOnKey="#"/>
    <Say>No message was recorded. Goodbye.</Say>
</Response>
"##;

/// TwiML ending the call after a recording.
pub const GOODBYE_TWIML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<Response>
    <Say>Thank you. Goodbye.</Say>
    <Hangup/>
</Response>
"#;

/// Empty TwiML; no reply is sent for inbound SMS.
pub const EMPTY_TWIML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<Response></Response>
"#;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub mailer: Arc<dyn Mailer>,
}

impl AppState {
    pub fn new(config: Config, mailer: impl Mailer + 'static) -> Self {
        Self {
            config: Arc::new(config),
            mailer: Arc::new(mailer),
        }
    }
}

fn twiml(body: &'static str) -> Response {
    ([(header::CONTENT_TYPE, "application/xml")], body).into_response()
}

fn internal_error() -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, "500 internal server error").into_response()
}

async fn relay(state: &AppState, notification: Notification) -> Result<(), Response> {
    let subject = notification.subject.clone();
    if let Err(e) = state.mailer.send(notification).await {
        error!(error = %e, subject = %subject, "notification_send_failed");
        return Err(internal_error());
    }
    Ok(())
}

// =============================================================================
// Health Check
// =============================================================================

/// Health check response.
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

/// Health check endpoint.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

// =============================================================================
// Voice
// =============================================================================

/// Incoming call: ask for a recording.
pub async fn record_start() -> Response {
    twiml(RECORD_TWIML)
}

/// Recording finished: mail the voicemail notification.
pub async fn record_finished(
    State(state): State<AppState>,
    client: ClientAddr,
    Extension(fields): Extension<FormFields>,
) -> Response {
    let call = RecordingFinished::from(&fields);
    info!(
        call_sid = %call.call_sid,
        remote_addr = %client,
        has_recording = !call.recording_url.is_empty(),
        "voicemail_received"
    );

    if let Err(response) = relay(&state, render_voicemail(&call, client.as_str())).await {
        return response;
    }

    twiml(GOODBYE_TWIML)
}

// =============================================================================
// SMS
// =============================================================================

/// Inbound SMS: mail the message.
pub async fn sms(
    State(state): State<AppState>,
    client: ClientAddr,
    Extension(fields): Extension<FormFields>,
) -> Response {
    let message = SmsReceived::from(&fields);
    info!(
        remote_addr = %client,
        body_length = message.body.len(),
        "sms_received"
    );

    if let Err(response) = relay(&state, render_sms(&message, client.as_str())).await {
        return response;
    }

    twiml(EMPTY_TWIML)
}
