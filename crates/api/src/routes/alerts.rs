//! Open billing alerts for the operator dashboard

use axum::{extract::State, Json};
use memberpass_billing::Alert;
use serde::Serialize;

use crate::{error::ApiResult, state::AppState};

#[derive(Debug, Serialize)]
pub struct AlertsResponse {
    pub alerts: Vec<Alert>,
    pub total: usize,
}

pub async fn list_open_alerts(State(state): State<AppState>) -> ApiResult<Json<AlertsResponse>> {
    let alerts = state.billing.alerts.list_open().await?;
    Ok(Json(AlertsResponse {
        total: alerts.len(),
        alerts,
    }))
}
