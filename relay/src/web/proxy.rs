//! Client address resolution behind a known number of reverse proxies.
//!
//! Every proxy appends the peer it saw to the right of `X-Forwarded-For`.
//! With `N` trusted proxies the rightmost `N` entries were written by them,
//! and the entry just left of those is the address the outermost trusted
//! proxy observed. Anything further left is client-controlled.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    async_trait,
    extract::{ConnectInfo, FromRequestParts, Request, State},
    http::{request::Parts, Extensions},
    middleware::Next,
    response::Response,
};
use governor::{
    clock::{Clock, DefaultClock},
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use tracing::warn;

pub const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";

/// Default spacing between repeated misconfiguration warnings.
const WARN_INTERVAL: Duration = Duration::from_secs(60);

/// The client address downstream handlers and logs should use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientAddr(pub String);

impl ClientAddr {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn from_peer(peer: Option<SocketAddr>) -> Self {
        match peer {
            Some(addr) => ClientAddr(addr.ip().to_string()),
            None => ClientAddr("unknown".to_string()),
        }
    }

    /// Resolved address if the proxy stage ran, otherwise the socket peer.
    pub(crate) fn from_extensions(extensions: &Extensions) -> Self {
        if let Some(addr) = extensions.get::<ClientAddr>() {
            return addr.clone();
        }

        let peer = extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);
        ClientAddr::from_peer(peer)
    }
}

impl std::fmt::Display for ClientAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for ClientAddr {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(ClientAddr::from_extensions(&parts.extensions))
    }
}

/// Pick the entry immediately left of the `depth` trusted entries.
///
/// Returns `None` when the chain is too short for the configured depth or
/// the selected entry is blank.
pub fn resolve_forwarded(depth: usize, header: Option<&str>) -> Option<&str> {
    let chain: Vec<&str> = header
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .collect();

    let index = chain.len().checked_sub(depth.checked_add(1)?)?;
    chain.get(index).copied().filter(|entry| !entry.is_empty())
}

/// Lets a warning through at most once per interval.
///
/// Counts what it swallowed so the next emitted warning can report it.
pub struct WarnThrottle<C: Clock = DefaultClock> {
    limiter: RateLimiter<NotKeyed, InMemoryState, C, NoOpMiddleware<C::Instant>>,
    suppressed: AtomicU64,
}

impl WarnThrottle {
    pub fn new(interval: Duration) -> Self {
        Self::with_clock(interval, DefaultClock::default())
    }
}

impl<C: Clock> WarnThrottle<C> {
    fn with_clock(interval: Duration, clock: C) -> Self {
        // A zero interval has no quota; fall back to one per minute
        let quota = Quota::with_period(interval)
            .unwrap_or_else(|| Quota::per_minute(NonZeroU32::MIN));

        Self {
            limiter: RateLimiter::direct_with_clock(quota, clock),
            suppressed: AtomicU64::new(0),
        }
    }

    /// Returns `Some(suppressed_since_last)` when the caller should log.
    pub fn permit(&self) -> Option<u64> {
        match self.limiter.check() {
            Ok(()) => Some(self.suppressed.swap(0, Ordering::AcqRel)),
            Err(_) => {
                self.suppressed.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }
}

impl<C: Clock> std::fmt::Debug for WarnThrottle<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WarnThrottle")
            .field("suppressed", &self.suppressed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Proxy-chain resolver configured with a trust depth.
#[derive(Debug)]
pub struct ProxyResolver {
    depth: usize,
    throttle: WarnThrottle,
}

impl ProxyResolver {
    /// `depth` below one is treated as one.
    pub fn new(depth: usize) -> Self {
        Self {
            depth: depth.max(1),
            throttle: WarnThrottle::new(WARN_INTERVAL),
        }
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Resolve the client address, falling back to the socket peer.
    ///
    /// The fallback means the configured depth does not match the actual
    /// topology, so it is always reported (throttled, never silenced).
    pub fn resolve(&self, header: Option<&str>, peer: Option<SocketAddr>) -> ClientAddr {
        if let Some(addr) = resolve_forwarded(self.depth, header) {
            return ClientAddr(addr.to_string());
        }

        let fallback = ClientAddr::from_peer(peer);
        if let Some(suppressed) = self.throttle.permit() {
            warn!(
                trust_depth = self.depth,
                forwarded_for = header.unwrap_or_default(),
                peer = %fallback,
                suppressed,
                "proxy_fix_unresolved: unable to determine client address from \
                 X-Forwarded-For, check PROXY_FIX and PROXY_FIX_NUM_PROXIES"
            );
        }
        fallback
    }
}

/// Axum middleware that records the resolved [`ClientAddr`] on the request.
pub async fn proxy_fix(
    State(resolver): State<Arc<ProxyResolver>>,
    mut request: Request,
    next: Next,
) -> Response {
    let header = request
        .headers()
        .get(FORWARDED_FOR_HEADER)
        .and_then(|v| v.to_str().ok());
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);

    let client = resolver.resolve(header, peer);
    request.extensions_mut().insert(client);

    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::count_warnings;
    use governor::clock::FakeRelativeClock;

    const CHAIN: &str = "203.0.113.5, 70.41.3.18, 150.172.238.178";

    fn peer() -> Option<SocketAddr> {
        Some("192.0.2.10:51000".parse().unwrap())
    }

    #[test]
    fn test_resolve_forwarded_by_depth() {
        assert_eq!(resolve_forwarded(1, Some(CHAIN)), Some("70.41.3.18"));
        assert_eq!(resolve_forwarded(2, Some(CHAIN)), Some("203.0.113.5"));
        assert_eq!(resolve_forwarded(3, Some(CHAIN)), None);
    }

    #[test]
    fn test_resolve_forwarded_tolerates_spacing() {
        assert_eq!(
            resolve_forwarded(1, Some("203.0.113.5,70.41.3.18")),
            Some("203.0.113.5")
        );
    }

    #[test]
    fn test_resolve_forwarded_empty_entries() {
        assert_eq!(resolve_forwarded(1, None), None);
        assert_eq!(resolve_forwarded(1, Some("")), None);
        assert_eq!(resolve_forwarded(1, Some(", 10.0.0.1")), None);
        assert_eq!(resolve_forwarded(0, Some("10.0.0.1")), Some("10.0.0.1"));
    }

    #[test]
    fn test_short_chain_falls_back_to_peer_with_warning() {
        let resolver = ProxyResolver::new(3);
        let warnings = count_warnings(|| {
            let addr = resolver.resolve(Some("203.0.113.5, 70.41.3.18"), peer());
            assert_eq!(addr, ClientAddr("192.0.2.10".to_string()));
        });
        assert_eq!(warnings, 1);
    }

    #[test]
    fn test_resolved_address_does_not_warn() {
        let resolver = ProxyResolver::new(1);
        let warnings = count_warnings(|| {
            assert_eq!(resolver.resolve(Some(CHAIN), peer()).as_str(), "70.41.3.18");
        });
        assert_eq!(warnings, 0);
    }

    #[test]
    fn test_repeated_misconfiguration_is_throttled() {
        let resolver = ProxyResolver::new(2);
        let warnings = count_warnings(|| {
            for _ in 0..10 {
                resolver.resolve(None, peer());
            }
        });
        assert_eq!(warnings, 1);
    }

    #[test]
    fn test_missing_peer_is_unknown() {
        let resolver = ProxyResolver::new(1);
        assert_eq!(resolver.resolve(None, None).as_str(), "unknown");
    }

    #[test]
    fn test_depth_is_at_least_one() {
        assert_eq!(ProxyResolver::new(0).depth(), 1);
    }

    #[test]
    fn test_throttle_reports_suppressed_count() {
        let clock = FakeRelativeClock::default();
        let throttle = WarnThrottle::with_clock(Duration::from_secs(60), clock.clone());

        assert_eq!(throttle.permit(), Some(0));
        clock.advance(Duration::from_secs(1));
        assert_eq!(throttle.permit(), None);
        clock.advance(Duration::from_secs(1));
        assert_eq!(throttle.permit(), None);
        clock.advance(Duration::from_secs(59));
        assert_eq!(throttle.permit(), Some(2));
        clock.advance(Duration::from_millis(500));
        assert_eq!(throttle.permit(), None);
    }
}
