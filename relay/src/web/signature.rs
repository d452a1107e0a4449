//! Twilio request signature verification.
//!
//! Twilio signs each webhook with HMAC-SHA1 over the full request URL
//! followed, for POST requests, by every form parameter name and value sorted
//! by name. The base64 digest arrives in the `X-Twilio-Signature` header.
//! Reference: https://www.twilio.com/docs/usage/security#validating-requests

use std::borrow::Cow;
use std::collections::BTreeMap;

use axum::http::Method;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use hmac::{Hmac, Mac};
use percent_encoding::percent_decode;
use secrecy::{ExposeSecret, SecretString};
use sha1::Sha1;
use subtle::{Choice, ConstantTimeEq};
use tracing::{info, warn};

use super::canonical::{CanonicalUrl, Scheme};
use crate::Config;

type HmacSha1 = Hmac<Sha1>;

/// Header carrying the presented signature.
pub const SIGNATURE_HEADER: &str = "x-twilio-signature";

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// Per-request verification errors.
///
/// These never escape the middleware: each one resolves to a rejection and is
/// only used to tell noise and attacks apart from misconfiguration in logs.
#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    #[error("signature header missing")]
    MissingSignature,

    #[error("signature header is not valid base64: {0}")]
    MalformedSignature(#[from] base64::DecodeError),

    #[error("form body could not be parsed: {0}")]
    MalformedForm(&'static str),

    #[error("no host available to rebuild the request URL")]
    MissingHost,

    #[error("malformed host: {0}")]
    MalformedHost(String),

    #[error("request body could not be read")]
    BodyUnreadable,
}

/// Why a request was rejected.
#[derive(Debug)]
pub enum Rejection {
    /// Well-formed request whose signature does not match.
    Mismatch,
    /// The request could not be checked at all.
    Malformed(VerifyError),
}

/// Outcome of verifying one request.
#[derive(Debug)]
pub enum Verdict {
    Accepted,
    Rejected(Rejection),
    /// No secret configured; the request was not authenticated.
    Disabled,
}

impl Verdict {
    /// Whether the request may proceed to the handler.
    pub fn allows(&self) -> bool {
        matches!(self, Verdict::Accepted | Verdict::Disabled)
    }
}

/// POST form fields, sorted by name, keeping only the first value per name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FormFields(BTreeMap<String, String>);

impl FormFields {
    /// Parse an `application/x-www-form-urlencoded` body.
    pub fn parse(body: &[u8]) -> Result<Self, VerifyError> {
        if std::str::from_utf8(body).is_err() {
            return Err(VerifyError::MalformedForm("body is not valid UTF-8"));
        }
        validate_percent_escapes(body)?;

        body.split(|&b| b == b'&')
            .filter(|pair| !pair.is_empty())
            .map(decode_pair)
            .collect()
    }

    /// First value of `name`, or an empty string if it was not sent.
    pub fn get(&self, name: &str) -> &str {
        self.0.get(name).map(String::as_str).unwrap_or_default()
    }

    fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for FormFields {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut fields = BTreeMap::new();
        for (k, v) in iter {
            fields.entry(k.into()).or_insert_with(|| v.into());
        }
        Self(fields)
    }
}

fn decode_pair(pair: &[u8]) -> Result<(String, String), VerifyError> {
    let mut parts = pair.splitn(2, |&b| b == b'=');
    let name = decode_component(parts.next().unwrap_or_default())?;
    let value = decode_component(parts.next().unwrap_or_default())?;
    Ok((name, value))
}

/// Decode one name or value, refusing escapes that do not decode to UTF-8.
fn decode_component(raw: &[u8]) -> Result<String, VerifyError> {
    let spaced: Vec<u8> = raw
        .iter()
        .map(|&b| if b == b'+' { b' ' } else { b })
        .collect();

    percent_decode(&spaced)
        .decode_utf8()
        .map(Cow::into_owned)
        .map_err(|_| VerifyError::MalformedForm("decoded value is not valid UTF-8"))
}

fn validate_percent_escapes(body: &[u8]) -> Result<(), VerifyError> {
    let mut i = 0;
    while i < body.len() {
        if body[i] == b'%' {
            let valid = body
                .get(i + 1..i + 3)
                .map(|hex| hex.iter().all(u8::is_ascii_hexdigit))
                .unwrap_or(false);
            if !valid {
                return Err(VerifyError::MalformedForm("invalid percent escape"));
            }
            i += 3;
        } else {
            i += 1;
        }
    }
    Ok(())
}

fn is_form_content_type(content_type: Option<&str>) -> bool {
    content_type
        .and_then(|ct| ct.split(';').next())
        .map(|media| media.trim().eq_ignore_ascii_case(FORM_CONTENT_TYPE))
        .unwrap_or(false)
}

/// Build the string the HMAC is computed over.
///
/// Non-POST methods sign the bare URL.
pub fn signature_base(url: &str, method: &Method, fields: &FormFields) -> String {
    let mut base = String::from(url);
    if *method == Method::POST {
        for (name, value) in fields.iter() {
            base.push_str(name);
            base.push_str(value);
        }
    }
    base
}

/// HMAC-SHA1 of the signature base string.
pub fn compute_signature(secret: &[u8], base: &str) -> Vec<u8> {
    // HMAC takes keys of any length; an empty digest would never match
    let Ok(mut mac) = HmacSha1::new_from_slice(secret) else {
        return Vec::new();
    };
    mac.update(base.as_bytes());
    mac.finalize().into_bytes().to_vec()
}

/// Sign a request the way Twilio does, returning the header value.
pub fn sign(secret: &str, url: &str, method: &Method, fields: &FormFields) -> String {
    STANDARD.encode(compute_signature(
        secret.as_bytes(),
        &signature_base(url, method, fields),
    ))
}

#[cfg(test)]
thread_local! {
    static COMPARISONS: std::cell::Cell<usize> = const { std::cell::Cell::new(0) };
}

#[cfg(test)]
pub(crate) fn comparison_count() -> usize {
    COMPARISONS.with(|c| c.get())
}

/// Constant-time equality of two digests.
///
/// Every signature comparison goes through here; never compare digests with
/// `==`.
pub fn signatures_match(expected: &[u8], presented: &[u8]) -> Choice {
    #[cfg(test)]
    COMPARISONS.with(|c| c.set(c.get() + 1));

    expected.ct_eq(presented)
}

fn decode_signature(header: Option<&str>) -> Result<Vec<u8>, VerifyError> {
    let header = header.map(str::trim).unwrap_or_default();
    if header.is_empty() {
        return Err(VerifyError::MissingSignature);
    }
    Ok(STANDARD.decode(header)?)
}

/// The parts of an HTTP request that take part in verification.
#[derive(Debug, Clone)]
pub struct SignedRequest<'a> {
    pub method: Method,
    /// Host header (or URI authority) as received.
    pub host: Option<&'a str>,
    pub path_and_query: &'a str,
    pub content_type: Option<&'a str>,
    pub body: &'a [u8],
    pub signature: Option<&'a str>,
}

impl SignedRequest<'_> {
    /// Form fields that take part in the signature.
    ///
    /// Only POST bodies declared as form-encoded contribute fields.
    pub fn form_fields(&self) -> Result<FormFields, VerifyError> {
        if self.method == Method::POST && is_form_content_type(self.content_type) {
            FormFields::parse(self.body)
        } else {
            Ok(FormFields::default())
        }
    }
}

/// Verifies Twilio request signatures with an immutable secret and URL policy.
#[derive(Debug)]
pub struct SignatureVerifier {
    secret: Option<SecretString>,
    scheme: Scheme,
    public_host: Option<String>,
}

impl SignatureVerifier {
    /// Create a verifier. Without a secret the verifier is disabled, which is
    /// announced once here.
    pub fn new(secret: Option<&str>, scheme: Scheme, public_host: Option<String>) -> Self {
        let secret = secret
            .filter(|s| !s.trim().is_empty())
            .map(|s| SecretString::new(s.into()));

        if secret.is_some() {
            info!(
                scheme = %scheme,
                public_host = ?public_host,
                "request_validation_enabled"
            );
        } else {
            warn!(
                "request_validation_disabled: TWILIO_AUTH_TOKEN was not provided, \
                 webhooks are accepted without authentication"
            );
        }

        Self {
            secret,
            scheme,
            public_host,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.twilio_auth_token.as_deref(),
            config.public_scheme,
            config.public_host.clone(),
        )
    }

    pub fn is_enabled(&self) -> bool {
        self.secret.is_some()
    }

    /// Decide whether `request` was signed with our secret.
    ///
    /// Both port forms of the canonical URL are always computed and compared,
    /// so a match on either form costs the same as a mismatch.
    pub fn verify(&self, request: &SignedRequest<'_>) -> Verdict {
        let Some(secret) = &self.secret else {
            return Verdict::Disabled;
        };

        match self.check(secret, request) {
            Ok(true) => Verdict::Accepted,
            Ok(false) => Verdict::Rejected(Rejection::Mismatch),
            Err(e) => Verdict::Rejected(Rejection::Malformed(e)),
        }
    }

    fn check(
        &self,
        secret: &SecretString,
        request: &SignedRequest<'_>,
    ) -> Result<bool, VerifyError> {
        let authority = self
            .public_host
            .as_deref()
            .or(request.host)
            .ok_or(VerifyError::MissingHost)?;
        let url = CanonicalUrl::new(self.scheme, authority, request.path_and_query)?;

        let fields = request.form_fields()?;

        let presented = decode_signature(request.signature)?;
        let key = secret.expose_secret().as_bytes();

        let mut matched = Choice::from(0u8);
        for candidate in url.candidates() {
            let base = signature_base(&candidate, &request.method, &fields);
            let expected = compute_signature(key, &base);
            matched |= signatures_match(&expected, &presented);
        }

        Ok(matched.into())
    }
}
