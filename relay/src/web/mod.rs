//! Web server module for handling Twilio webhooks.
//!
//! Requests pass two stages before reaching a handler:
//! - the proxy resolver (optional) relabels the client address from
//!   `X-Forwarded-For`
//! - the signature verifier gates every webhook route
//!
//! ```text
//! request → proxy_fix → trace → verify_twilio_signature → handler → Mailer
//! ```

pub mod canonical;
pub mod handlers;
pub mod middleware;
pub mod proxy;
pub mod signature;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    middleware::from_fn_with_state,
    routing::{get, post},
    Router,
};
use tower_http::{limit::RequestBodyLimitLayer, timeout::TimeoutLayer, trace::TraceLayer};
use tracing::info;

pub use canonical::{CanonicalUrl, Scheme};
pub use handlers::{health, record_finished, record_start, sms, AppState, HealthResponse};
pub use middleware::{verify_twilio_signature, SignatureState};
pub use proxy::{proxy_fix, resolve_forwarded, ClientAddr, ProxyResolver};
pub use signature::{sign, Rejection, SignatureVerifier, SignedRequest, Verdict, VerifyError};

/// Build the application router from its state.
pub fn router(state: AppState) -> Router {
    let config = state.config.clone();

    let signature = SignatureState::new(
        SignatureVerifier::from_config(&config),
        config.max_body_bytes,
    );

    let webhooks = Router::new()
        .route("/record/start.xml", post(record_start))
        .route("/record/finished.xml", post(record_finished))
        .route("/sms", post(sms))
        .route_layer(from_fn_with_state(signature, verify_twilio_signature));

    let mut app = Router::new()
        .route("/", get(health))
        .route("/health", get(health))
        .merge(webhooks)
        .layer(TimeoutLayer::new(Duration::from_millis(config.request_timeout_ms)))
        .layer(TraceLayer::new_for_http())
        .layer(RequestBodyLimitLayer::new(config.max_body_bytes));

    // Outermost, so every later stage sees the resolved address
    if let Some(depth) = config.trust_depth() {
        info!(trust_depth = depth, "proxy_fix_enabled");
        app = app.layer(from_fn_with_state(Arc::new(ProxyResolver::new(depth)), proxy_fix));
    }

    app.with_state(state)
}
