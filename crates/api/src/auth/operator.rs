//! Operator bearer-token middleware
//!
//! Plan edits, manual resume, event replay and alert listing are operator
//! actions. They authenticate with a single static token from
//! `OPERATOR_API_TOKEN`, compared in constant time.

use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::{IntoResponse, Response},
};
use subtle::ConstantTimeEq;

use crate::error::ApiError;
use crate::state::AppState;

/// Marker inserted into request extensions once the operator token checks out
#[derive(Debug, Clone, Copy)]
pub struct OperatorIdentity;

fn extract_bearer_token(request: &Request) -> Option<&str> {
    request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Constant-time comparison to prevent timing attacks
fn constant_time_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        // Same amount of work as a real comparison
        let dummy = vec![0u8; a.len()];
        let _ = a.as_bytes().ct_eq(&dummy);
        return false;
    }

    a.as_bytes().ct_eq(b.as_bytes()).into()
}

pub async fn require_operator(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();

    let result = match extract_bearer_token(&request) {
        None => Err(ApiError::Unauthorized),
        Some(token) if constant_time_compare(token, &state.operator_token) => Ok(()),
        Some(_) => Err(ApiError::InvalidToken),
    };

    match result {
        Ok(()) => {
            tracing::debug!(path = %path, "require_operator: authenticated");
            request.extensions_mut().insert(OperatorIdentity);
            next.run(request).await
        }
        Err(err) => {
            tracing::warn!(path = %path, error = %err, "require_operator: authentication failed");
            err.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_time_compare() {
        assert!(constant_time_compare("operator-token", "operator-token"));
        assert!(!constant_time_compare("operator-token", "operator-tokex"));
        assert!(!constant_time_compare("short", "operator-token"));
        assert!(!constant_time_compare("", "operator-token"));
    }

    #[test]
    fn test_extract_bearer_token() {
        let request = axum::http::Request::builder()
            .header(AUTHORIZATION, "Bearer abc123")
            .body(axum::body::Body::empty())
            .unwrap();
        assert_eq!(extract_bearer_token(&request), Some("abc123"));

        let basic = axum::http::Request::builder()
            .header(AUTHORIZATION, "Basic abc123")
            .body(axum::body::Body::empty())
            .unwrap();
        assert_eq!(extract_bearer_token(&basic), None);

        let empty = axum::http::Request::builder()
            .header(AUTHORIZATION, "Bearer ")
            .body(axum::body::Body::empty())
            .unwrap();
        assert_eq!(extract_bearer_token(&empty), None);
    }
}
