//! Axum glue for the signature verifier.
//!
//! The body is buffered to extract form fields for the signature and then put
//! back so handlers can still read it. Requests that get through also carry
//! the parsed [`FormFields`], so handlers see exactly the values that were
//! signed.

use std::sync::Arc;

use axum::{
    body::{to_bytes, Body},
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::{debug, warn};

use super::proxy::ClientAddr;
use super::signature::{
    FormFields, Rejection, SignatureVerifier, SignedRequest, Verdict, VerifyError,
    SIGNATURE_HEADER,
};

/// State for [`verify_twilio_signature`].
#[derive(Clone)]
pub struct SignatureState {
    pub verifier: Arc<SignatureVerifier>,
    pub max_body_bytes: usize,
}

impl SignatureState {
    pub fn new(verifier: SignatureVerifier, max_body_bytes: usize) -> Self {
        Self {
            verifier: Arc::new(verifier),
            max_body_bytes,
        }
    }
}

fn forbidden() -> Response {
    (StatusCode::FORBIDDEN, "403 forbidden").into_response()
}

/// Reject requests that do not carry a valid Twilio signature.
///
/// All rejections look the same to the caller: `403` with no detail.
pub async fn verify_twilio_signature(
    State(state): State<SignatureState>,
    request: Request,
    next: Next,
) -> Response {
    let remote_addr = ClientAddr::from_extensions(request.extensions());
    let (mut parts, body) = request.into_parts();

    let bytes = match to_bytes(body, state.max_body_bytes).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(
                remote_addr = %remote_addr,
                path = %parts.uri.path(),
                error = %e,
                reason = %VerifyError::BodyUnreadable,
                "signature_malformed"
            );
            return forbidden();
        }
    };

    let (verdict, fields) = {
        let host = parts
            .headers
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .or_else(|| parts.uri.authority().map(|a| a.as_str()));

        let signed = SignedRequest {
            method: parts.method.clone(),
            host,
            path_and_query: parts
                .uri
                .path_and_query()
                .map(|pq| pq.as_str())
                .unwrap_or("/"),
            content_type: parts
                .headers
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok()),
            body: &bytes,
            signature: parts
                .headers
                .get(SIGNATURE_HEADER)
                .and_then(|v| v.to_str().ok()),
        };

        let verdict = state.verifier.verify(&signed);
        // With verification disabled an unparseable form is forwarded without fields
        let fields = if verdict.allows() {
            signed.form_fields().unwrap_or_default()
        } else {
            FormFields::default()
        };
        (verdict, fields)
    };

    match verdict {
        Verdict::Accepted => {
            debug!(remote_addr = %remote_addr, path = %parts.uri.path(), "signature_valid");
        }
        Verdict::Disabled => {
            debug!(remote_addr = %remote_addr, path = %parts.uri.path(), "signature_not_checked");
        }
        Verdict::Rejected(Rejection::Mismatch) => {
            warn!(remote_addr = %remote_addr, path = %parts.uri.path(), "signature_mismatch");
            return forbidden();
        }
        Verdict::Rejected(Rejection::Malformed(e)) => {
            warn!(
                remote_addr = %remote_addr,
                path = %parts.uri.path(),
                reason = %e,
                "signature_malformed"
            );
            return forbidden();
        }
    }

    parts.extensions.insert(fields);
    next.run(Request::from_parts(parts, Body::from(bytes))).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::web::canonical::Scheme;
    use crate::web::signature::sign;
    use axum::{http::Method, middleware, routing::post, Extension, Router};
    use tower::ServiceExt;

    const SECRET: &str = "s3cr3t";
    const BODY: &str = "CallSid=CA123&From=%2B15551234567";

    fn app(secret: Option<&str>, max_body_bytes: usize) -> Router {
        let state = SignatureState::new(
            SignatureVerifier::new(secret, Scheme::Https, None),
            max_body_bytes,
        );
        Router::new()
            .route("/record/finished.xml", post(|body: String| async move { body }))
            .route_layer(middleware::from_fn_with_state(state, verify_twilio_signature))
    }

    fn signed_request(signature: &str, body: &'static str) -> Request {
        Request::builder()
            .method(Method::POST)
            .uri("/record/finished.xml")
            .header(header::HOST, "example.com")
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .header(SIGNATURE_HEADER, signature)
            .body(Body::from(body))
            .unwrap()
    }

    fn valid_signature() -> String {
        sign(
            SECRET,
            "https://example.com/record/finished.xml",
            &Method::POST,
            &FormFields::parse(BODY.as_bytes()).unwrap(),
        )
    }

    async fn body_string(response: Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_valid_signature_passes_body_through() {
        let response = app(Some(SECRET), 1024)
            .oneshot(signed_request(&valid_signature(), BODY))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, BODY);
    }

    #[tokio::test]
    async fn test_invalid_signature_is_forbidden_without_detail() {
        let response = app(Some(SECRET), 1024)
            .oneshot(signed_request("AAAAAAAAAAAAAAAAAAAAAAAAAAA=", BODY))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(body_string(response).await, "403 forbidden");
    }

    #[tokio::test]
    async fn test_malformed_signature_looks_like_mismatch() {
        let response = app(Some(SECRET), 1024)
            .oneshot(signed_request("%%%", BODY))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(body_string(response).await, "403 forbidden");
    }

    #[tokio::test]
    async fn test_tampered_body_is_forbidden() {
        let response = app(Some(SECRET), 1024)
            .oneshot(signed_request(
                &valid_signature(),
                "CallSid=CA999&From=%2B15551234567",
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_oversized_body_is_forbidden() {
        let response = app(Some(SECRET), 8)
            .oneshot(signed_request(&valid_signature(), BODY))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_forwarded_request_carries_signed_fields() {
        let verifier = SignatureVerifier::new(Some(SECRET), Scheme::Https, None);
        let state = SignatureState::new(verifier, 1024);
        let app = Router::new()
            .route(
                "/record/finished.xml",
                post(|Extension(fields): Extension<FormFields>| async move {
                    fields.get("From").to_string()
                }),
            )
            .route_layer(middleware::from_fn_with_state(state, verify_twilio_signature));

        let response = app
            .oneshot(signed_request(&valid_signature(), BODY))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "+15551234567");
    }

    #[tokio::test]
    async fn test_disabled_verifier_passes_everything() {
        let response = app(None, 1024)
            .oneshot(signed_request("garbage", BODY))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, BODY);
    }
}
