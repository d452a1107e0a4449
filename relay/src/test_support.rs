//! Shared helpers for unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use async_trait::async_trait;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

use crate::notify::{Mailer, Notification};
use crate::web::Scheme;
use crate::Config;

struct WarnCounter(Arc<AtomicUsize>);

impl<S: Subscriber> Layer<S> for WarnCounter {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if *event.metadata().level() == Level::WARN {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Run `f` under a scoped subscriber and return how many warnings it emitted.
pub fn count_warnings(f: impl FnOnce()) -> usize {
    let count = Arc::new(AtomicUsize::new(0));
    let subscriber = tracing_subscriber::registry().with(WarnCounter(count.clone()));
    tracing::subscriber::with_default(subscriber, f);
    count.load(Ordering::SeqCst)
}

pub fn test_config(secret: Option<&str>) -> Config {
    Config {
        port: 8080,
        bind_local: true,
        twilio_auth_token: secret.map(str::to_string),
        public_scheme: Scheme::Https,
        public_host: None,
        proxy_fix: false,
        proxy_fix_num_proxies: 1,
        max_body_bytes: 64 * 1024,
        request_timeout_ms: 10_000,
    }
}

/// Mailer that keeps what it was given.
#[derive(Clone, Default)]
pub struct RecordingMailer {
    sent: Arc<Mutex<Vec<Notification>>>,
    fail: bool,
}

impl RecordingMailer {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send(&self, notification: Notification) -> Result<()> {
        if self.fail {
            bail!("smtp server unavailable");
        }
        self.sent.lock().unwrap().push(notification);
        Ok(())
    }
}
