//! Operator remediation for stored webhook events

use axum::{
    extract::{Path, State},
    Json,
};
use memberpass_billing::ReceiveOutcome;
use serde::Serialize;

use crate::{error::ApiResult, state::AppState};

#[derive(Debug, Serialize)]
pub struct ReplayResponse {
    pub event_id: String,
    /// `false` when the event had already been processed
    pub replayed: bool,
    pub outcome: Option<String>,
}

/// Re-dispatch a stored event from its persisted payload
pub async fn replay_event(
    State(state): State<AppState>,
    Path(event_id): Path<String>,
) -> ApiResult<Json<ReplayResponse>> {
    let response = match state.billing.events.replay(&event_id).await? {
        ReceiveOutcome::Processed { event_id, outcome } => ReplayResponse {
            event_id,
            replayed: true,
            outcome: Some(format!("{:?}", outcome)),
        },
        ReceiveOutcome::Duplicate { event_id } => ReplayResponse {
            event_id,
            replayed: false,
            outcome: None,
        },
    };

    tracing::info!(
        event_id = %response.event_id,
        replayed = response.replayed,
        "Operator replayed event"
    );

    Ok(Json(response))
}
