//! Stripe webhook intake

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
};
use memberpass_billing::{BillingError, ReceiveOutcome};

use crate::{error::ApiError, state::AppState};

/// Handle Stripe webhook events
///
/// The body is taken as a raw string because the signature covers the exact
/// bytes Stripe sent. Signature and payload errors return 400 before anything
/// is stored; a handler failure returns 500 so Stripe redelivers the event.
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Result<StatusCode, ApiError> {
    tracing::info!(body_len = body.len(), "Stripe webhook received");

    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            tracing::warn!("Stripe webhook missing signature header");
            ApiError::BadRequest("Missing Stripe signature".to_string())
        })?;

    match state.billing.events.receive(&body, signature).await {
        Ok(ReceiveOutcome::Processed { event_id, outcome }) => {
            tracing::info!(event_id = %event_id, outcome = ?outcome, "Stripe webhook processed successfully");
            Ok(StatusCode::OK)
        }
        Ok(ReceiveOutcome::Duplicate { event_id }) => {
            tracing::info!(event_id = %event_id, "Stripe webhook already processed");
            Ok(StatusCode::OK)
        }
        Err(BillingError::WebhookSignatureInvalid) => {
            tracing::warn!("Stripe webhook signature verification failed");
            Err(ApiError::BadRequest("Invalid webhook signature".to_string()))
        }
        Err(e) => {
            tracing::error!(error = %e, "Webhook handling error");
            Err(e.into())
        }
    }
}
