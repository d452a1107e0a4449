//! mmrelay - Telephony webhook relay.
//!
//! Receives Twilio voice-recording and SMS callbacks, checks that they were
//! really sent by Twilio, and relays a rendered notification to a mailer.
//!
//! ## Architecture
//!
//! ```text
//! Twilio → proxy resolver → signature verifier → handler → Mailer
//! ```
//!
//! The authentication core lives in [`web::signature`], [`web::canonical`]
//! and [`web::proxy`]; none of it depends on process-wide state.

pub mod config;
pub mod notify;
pub mod web;

#[cfg(test)]
pub(crate) mod test_support;

// Re-export commonly used types
pub use config::Config;
pub use notify::{LogMailer, Mailer, Notification};
pub use web::{router, AppState, ClientAddr, SignatureVerifier, Verdict};
