//! Canonical request URL reconstruction.
//!
//! Twilio signs the full URL it requested. Behind proxies and TLS terminators
//! the server cannot observe that URL directly, so it is rebuilt from the
//! configured scheme, the host, and the path exactly as received.
//!
//! The port is the ambiguous part: depending on deployment the signer may
//! have included the default port or not, so both forms are produced.

use std::fmt;
use std::str::FromStr;

use super::signature::VerifyError;

/// URL scheme the provider uses to reach this service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn default_port(self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unsupported scheme: {0}")]
pub struct UnknownScheme(String);

impl FromStr for Scheme {
    type Err = UnknownScheme;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Ok(Scheme::Http),
            "https" => Ok(Scheme::Https),
            _ => Err(UnknownScheme(s.to_string())),
        }
    }
}

/// Split an authority into host and optional port.
///
/// IPv6 literals keep their brackets so the host can be put back into a URL
/// unchanged.
pub fn split_host_port(authority: &str) -> Result<(&str, Option<u16>), VerifyError> {
    let authority = authority.trim();

    let (host, port) = if authority.starts_with('[') {
        let end = authority
            .find(']')
            .ok_or_else(|| VerifyError::MalformedHost(authority.to_string()))?;
        let (host, rest) = authority.split_at(end + 1);
        match rest {
            "" => (host, None),
            _ => match rest.strip_prefix(':') {
                Some(port) => (host, Some(port)),
                None => return Err(VerifyError::MalformedHost(authority.to_string())),
            },
        }
    } else {
        match authority.rsplit_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (authority, None),
        }
    };

    if host.is_empty() || host == "[]" {
        return Err(VerifyError::MissingHost);
    }

    let port = match port {
        Some(p) => Some(
            p.parse::<u16>()
                .map_err(|_| VerifyError::MalformedHost(authority.to_string()))?,
        ),
        None => None,
    };

    Ok((host, port))
}

/// The URL the signing party is assumed to have requested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalUrl {
    scheme: Scheme,
    host: String,
    port: Option<u16>,
    path_and_query: String,
}

impl CanonicalUrl {
    /// Build from the configured scheme, an authority (`host[:port]`) and the
    /// request's path and query as received.
    pub fn new(scheme: Scheme, authority: &str, path_and_query: &str) -> Result<Self, VerifyError> {
        let (host, port) = split_host_port(authority)?;

        let path_and_query = if path_and_query.is_empty() {
            "/".to_string()
        } else {
            path_and_query.to_string()
        };

        Ok(Self {
            scheme,
            host: host.to_string(),
            // A default port is never part of the primary form
            port: port.filter(|p| *p != scheme.default_port()),
            path_and_query,
        })
    }

    fn render(&self, port: Option<u16>) -> String {
        match port {
            Some(port) => format!(
                "{}://{}:{}{}",
                self.scheme, self.host, port, self.path_and_query
            ),
            None => format!("{}://{}{}", self.scheme, self.host, self.path_and_query),
        }
    }

    /// Port included only when it is explicit and non-default.
    pub fn primary(&self) -> String {
        self.render(self.port)
    }

    /// The opposite port-inclusion form of [`primary`](Self::primary).
    pub fn alternate(&self) -> String {
        match self.port {
            Some(_) => self.render(None),
            None => self.render(Some(self.scheme.default_port())),
        }
    }

    pub fn candidates(&self) -> [String; 2] {
        [self.primary(), self.alternate()]
    }
}

impl fmt::Display for CanonicalUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.primary())
    }
}
