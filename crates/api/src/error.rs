//! API error types and handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use memberpass_billing::BillingError;
use serde_json::json;

/// Application error type
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    // Authentication errors
    #[error("Authentication required")]
    Unauthorized,
    #[error("Invalid or expired token")]
    InvalidToken,

    // Validation errors
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Invalid request: {0}")]
    BadRequest(String),

    // Resource errors
    #[error("Not found: {0}")]
    NotFound(String),

    // Webhook errors
    #[error("Webhook processing failed: {0}")]
    WebhookFailed(String),

    // Upstream errors
    #[error("Payment processor error: {0}")]
    Upstream(String),

    // Internal errors
    #[error("Database error: {0}")]
    Database(String),
    #[error("Internal server error")]
    Internal,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            // Authentication
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", self.to_string()),
            ApiError::InvalidToken => (StatusCode::UNAUTHORIZED, "INVALID_TOKEN", self.to_string()),

            // Validation
            ApiError::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),

            // Resources
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),

            // Webhooks: a 5xx makes Stripe redeliver the event
            ApiError::WebhookFailed(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "WEBHOOK_FAILED",
                "Webhook processing failed".to_string(),
            ),

            // Upstream
            ApiError::Upstream(msg) => (StatusCode::BAD_GATEWAY, "UPSTREAM_ERROR", msg.clone()),

            // Internal
            ApiError::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, "DATABASE_ERROR", "Database error".to_string()),
            ApiError::Internal => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", self.to_string()),
        };

        let body = Json(json!({
            "error": {
                "code": code,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        if err.is_validation() {
            return ApiError::Validation(err.to_string());
        }
        match err {
            BillingError::WebhookSignatureInvalid => {
                ApiError::BadRequest("Invalid webhook signature".to_string())
            }
            BillingError::WebhookPayloadInvalid(msg) => {
                ApiError::BadRequest(format!("Malformed webhook payload: {}", msg))
            }
            BillingError::WebhookHandlerFailed { event_id, message } => {
                ApiError::WebhookFailed(format!("{}: {}", event_id, message))
            }
            BillingError::NotFound(what) => ApiError::NotFound(format!("{} not found", what)),
            BillingError::StripeApi(msg) | BillingError::Timeout(msg) => ApiError::Upstream(msg),
            BillingError::Database(msg) => {
                tracing::error!(error = %msg, "Billing store error");
                ApiError::Database(msg)
            }
            other => {
                tracing::error!(error = %other, "Unexpected billing error");
                ApiError::Internal
            }
        }
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        tracing::error!("Database error: {:?}", err);
        match err {
            sqlx::Error::RowNotFound => ApiError::NotFound("Resource not found".to_string()),
            _ => ApiError::Database(err.to_string()),
        }
    }
}

/// Result type alias for API handlers
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use memberpass_billing::OnboardingStatus;

    fn status_of(err: BillingError) -> StatusCode {
        ApiError::from(err).into_response().status()
    }

    #[test]
    fn test_billing_error_statuses() {
        assert_eq!(status_of(BillingError::WebhookSignatureInvalid), StatusCode::BAD_REQUEST);
        assert_eq!(
            status_of(BillingError::WebhookPayloadInvalid("no id".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(BillingError::WebhookHandlerFailed {
                event_id: "evt_1".into(),
                message: "boom".into()
            }),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(status_of(BillingError::NotFound("plan".into())), StatusCode::NOT_FOUND);
        assert_eq!(
            status_of(BillingError::InvalidTransition {
                from: OnboardingStatus::Created,
                to: OnboardingStatus::OnboardingComplete,
            }),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(status_of(BillingError::StripeApi("down".into())), StatusCode::BAD_GATEWAY);
    }
}
