//! Billing error types

use memberpass_shared::{Month, SharedError};
use thiserror::Error;
use uuid::Uuid;

use crate::onboarding::OnboardingStatus;

/// Billing-specific errors
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Stripe API error: {0}")]
    StripeApi(String),

    #[error("Webhook signature verification failed")]
    WebhookSignatureInvalid,

    #[error("Malformed webhook payload: {0}")]
    WebhookPayloadInvalid(String),

    #[error("Webhook event {event_id} failed: {message}")]
    WebhookHandlerFailed { event_id: String, message: String },

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Plan {plan_id} has no price for {month}")]
    PriceUnavailable { plan_id: Uuid, month: Month },

    #[error("Onboarding transition {from} -> {to} is not allowed")]
    InvalidTransition {
        from: OnboardingStatus,
        to: OnboardingStatus,
    },

    #[error("Operation timed out: {0}")]
    Timeout(String),
}

impl BillingError {
    /// Errors caused by operator input rather than by a collaborator failing
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            BillingError::InvalidInput(_)
                | BillingError::InvalidTransition { .. }
                | BillingError::PriceUnavailable { .. }
        )
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(err: stripe::StripeError) -> Self {
        BillingError::StripeApi(err.to_string())
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(err.to_string())
    }
}

impl From<SharedError> for BillingError {
    fn from(err: SharedError) -> Self {
        BillingError::InvalidInput(err.to_string())
    }
}

impl From<reqwest::Error> for BillingError {
    fn from(err: reqwest::Error) -> Self {
        BillingError::StripeApi(err.to_string())
    }
}

pub type BillingResult<T> = Result<T, BillingError>;
