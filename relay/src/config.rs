//! Configuration module for environment variable parsing.
//!
//! Everything is read once at startup into an immutable [`Config`] that is
//! handed to the middleware stages explicitly.

use std::env;
use std::fmt;
use tracing::warn;

use crate::web::canonical::{split_host_port, Scheme};

/// Application configuration loaded from environment variables.
#[derive(Clone)]
pub struct Config {
    /// Port for the web server to listen on
    pub port: u16,

    /// Bind to the IPv6 loopback only
    pub bind_local: bool,

    /// Twilio auth token used as the HMAC key for request validation
    pub twilio_auth_token: Option<String>,

    /// Scheme the provider uses to reach us (never taken from request headers)
    pub public_scheme: Scheme,

    /// Public host[:port], used instead of the Host header when set
    pub public_host: Option<String>,

    // =========================================================================
    // Reverse proxy handling
    // =========================================================================

    /// Resolve client addresses from X-Forwarded-For
    pub proxy_fix: bool,

    /// Number of trusted reverse proxies in front of the service
    pub proxy_fix_num_proxies: usize,

    /// Maximum accepted request body size in bytes
    pub max_body_bytes: usize,

    /// Per-request timeout in milliseconds
    pub request_timeout_ms: u64,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        Config {
            port: env::var("PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8080),

            bind_local: parse_bool("BIND_LOCAL", false),

            twilio_auth_token: env::var("TWILIO_AUTH_TOKEN")
                .ok()
                .filter(|v| !v.trim().is_empty()),

            public_scheme: parse_scheme("PUBLIC_SCHEME", Scheme::Https),

            public_host: parse_public_host("PUBLIC_HOST"),

            proxy_fix: parse_bool("PROXY_FIX", false),

            proxy_fix_num_proxies: parse_num_proxies("PROXY_FIX_NUM_PROXIES"),

            max_body_bytes: env::var("MAX_BODY_BYTES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(64 * 1024),

            request_timeout_ms: env::var("REQUEST_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10_000),
        }
    }

    /// Trust depth for the proxy resolver, or `None` when it is disabled.
    pub fn trust_depth(&self) -> Option<usize> {
        self.proxy_fix.then_some(self.proxy_fix_num_proxies)
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("port", &self.port)
            .field("bind_local", &self.bind_local)
            .field(
                "twilio_auth_token",
                &self.twilio_auth_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("public_scheme", &self.public_scheme)
            .field("public_host", &self.public_host)
            .field("proxy_fix", &self.proxy_fix)
            .field("proxy_fix_num_proxies", &self.proxy_fix_num_proxies)
            .field("max_body_bytes", &self.max_body_bytes)
            .field("request_timeout_ms", &self.request_timeout_ms)
            .finish()
    }
}

/// Parse a boolean flag such as "1", "true" or "yes".
fn parse_bool(name: &str, default: bool) -> bool {
    let raw = match env::var(name) {
        Ok(v) => v,
        Err(_) => return default,
    };

    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" | "" => false,
        _ => {
            warn!(env_var = name, value = %raw, "Invalid boolean, using default");
            default
        }
    }
}

fn parse_scheme(name: &str, default: Scheme) -> Scheme {
    let raw = match env::var(name) {
        Ok(v) => v,
        Err(_) => return default,
    };

    raw.trim().parse().unwrap_or_else(|_| {
        warn!(env_var = name, value = %raw, "Invalid scheme, using default");
        default
    })
}

/// A bare `host[:port]`; a URL or a bad port falls back to the Host header.
fn parse_public_host(name: &str) -> Option<String> {
    let raw = env::var(name).ok()?;
    let host = raw.trim();
    if host.is_empty() {
        return None;
    }

    if host.contains('/') || split_host_port(host).is_err() {
        warn!(
            env_var = name,
            value = %raw,
            "Invalid public host, expected host[:port], using the Host header"
        );
        return None;
    }

    Some(host.to_string())
}

/// Trust depth must be at least one; anything else is clamped.
fn parse_num_proxies(name: &str) -> usize {
    let raw = match env::var(name) {
        Ok(v) => v,
        Err(_) => return 1,
    };

    match raw.trim().parse::<i64>() {
        Ok(n) if n >= 1 => n as usize,
        _ => {
            warn!(env_var = name, value = %raw, "Trust depth must be >= 1, using 1");
            1
        }
    }
}
