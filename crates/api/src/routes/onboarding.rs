//! Business onboarding status and history

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use memberpass_billing::{OnboardingStatus, OnboardingTransition};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

#[derive(Debug, Serialize)]
pub struct OnboardingResponse {
    pub business_id: Uuid,
    pub status: OnboardingStatus,
    pub stripe_account_id: Option<String>,
    pub history: Vec<OnboardingTransition>,
}

#[derive(Debug, Deserialize)]
pub struct TransitionRequest {
    pub to: OnboardingStatus,
    pub reason: String,
}

pub async fn get_onboarding(
    State(state): State<AppState>,
    Path(business_id): Path<Uuid>,
) -> ApiResult<Json<OnboardingResponse>> {
    let business = state
        .billing
        .store
        .get_business(business_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("business {} not found", business_id)))?;
    let history = state.billing.onboarding.history(business_id).await?;

    Ok(Json(OnboardingResponse {
        business_id,
        status: business.onboarding_status,
        stripe_account_id: business.stripe_account_id,
        history,
    }))
}

/// User-initiated status change, validated against the transition table
pub async fn request_transition(
    State(state): State<AppState>,
    Path(business_id): Path<Uuid>,
    Json(req): Json<TransitionRequest>,
) -> ApiResult<(StatusCode, Json<OnboardingTransition>)> {
    if req.reason.trim().is_empty() {
        return Err(ApiError::Validation("reason must not be empty".to_string()));
    }

    let transition = state
        .billing
        .onboarding
        .request_transition(business_id, req.to, &req.reason)
        .await?;

    Ok((StatusCode::CREATED, Json(transition)))
}
