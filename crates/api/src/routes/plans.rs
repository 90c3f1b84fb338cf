//! Operator plan management
//!
//! `PATCH /plans/:plan_id` is the single entry point for renames, activation,
//! FIXED/DYNAMIC migration, base-price changes and monthly schedule edits.
//! All amounts are integer minor units.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use memberpass_billing::{
    BillingError, FixedMigrationReport, Plan, PlanUpdate, PlanUpdateResult, PriceQueueItem,
    ResumeItemOutcome, ResumeSummary,
};
use memberpass_shared::{MinorUnits, Month};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{error::ApiResult, state::AppState};

// =============================================================================
// Response types
// =============================================================================

#[derive(Debug, Serialize)]
pub struct ScheduleChangeResponse {
    pub removed: u64,
    pub queued: Vec<Month>,
    pub repriced: Vec<Month>,
    pub applied: Option<Month>,
}

#[derive(Debug, Serialize)]
pub struct MigrationResponse {
    pub direction: &'static str,
    pub price_id: String,
    pub considered: usize,
    pub updated: usize,
    pub failed: Vec<SubscriptionErrorResponse>,
    pub archived: u64,
}

#[derive(Debug, Serialize)]
pub struct SubscriptionErrorResponse {
    pub stripe_subscription_id: String,
    pub error: String,
}

#[derive(Debug, Serialize)]
pub struct ResumeResponse {
    pub plan_id: Uuid,
    pub price_id: String,
    pub considered: usize,
    pub resumed: usize,
    pub charged: usize,
    pub skipped: usize,
    pub errors: usize,
    pub failures: Vec<SubscriptionErrorResponse>,
}

impl From<ResumeSummary> for ResumeResponse {
    fn from(summary: ResumeSummary) -> Self {
        let failures = summary
            .failures()
            .filter_map(|item| match &item.outcome {
                ResumeItemOutcome::Failed(error) => Some(SubscriptionErrorResponse {
                    stripe_subscription_id: item.stripe_subscription_id.clone(),
                    error: error.clone(),
                }),
                _ => None,
            })
            .collect();

        Self {
            plan_id: summary.plan_id,
            price_id: summary.price_id,
            considered: summary.considered,
            resumed: summary.resumed,
            charged: summary.charged,
            skipped: summary.skipped,
            errors: summary.errors,
            failures,
        }
    }
}

fn fixed_migration(report: FixedMigrationReport) -> MigrationResponse {
    MigrationResponse {
        direction: "to_fixed",
        price_id: report.price_id,
        considered: report.considered,
        updated: report.updated,
        failed: report
            .failed
            .into_iter()
            .map(|f| SubscriptionErrorResponse {
                stripe_subscription_id: f.stripe_subscription_id,
                error: f.error,
            })
            .collect(),
        archived: report.archived,
    }
}

#[derive(Debug, Serialize)]
pub struct PlanUpdateResponse {
    pub plan: Option<Plan>,
    pub schedule: Option<ScheduleChangeResponse>,
    pub migration: Option<MigrationResponse>,
    pub new_base_price_id: Option<String>,
    pub resume: Option<ResumeResponse>,
}

impl From<PlanUpdateResult> for PlanUpdateResponse {
    fn from(result: PlanUpdateResult) -> Self {
        let migration = match (result.to_dynamic, result.to_fixed) {
            (Some(report), _) => Some(MigrationResponse {
                direction: "to_dynamic",
                price_id: report.price_id,
                considered: 0,
                updated: 0,
                failed: Vec::new(),
                archived: 0,
            }),
            (None, Some(report)) => Some(fixed_migration(report)),
            (None, None) => None,
        };

        Self {
            plan: result.plan,
            schedule: result.schedule.map(|s| ScheduleChangeResponse {
                removed: s.removed,
                queued: s.queued,
                repriced: s.repriced,
                applied: s.applied,
            }),
            migration,
            new_base_price_id: result.new_base_price_id,
            resume: result.resume.map(ResumeResponse::from),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PriceResponse {
    pub plan_id: Uuid,
    pub month: Month,
    pub available: bool,
    pub price_cents: Option<MinorUnits>,
    pub stripe_price_id: Option<String>,
}

impl PriceResponse {
    fn resolved(plan_id: Uuid, month: Month, item: PriceQueueItem) -> Self {
        Self {
            plan_id,
            month,
            available: true,
            price_cents: Some(item.price),
            stripe_price_id: item.stripe_price_id,
        }
    }

    fn unavailable(plan_id: Uuid, month: Month) -> Self {
        Self {
            plan_id,
            month,
            available: false,
            price_cents: None,
            stripe_price_id: None,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct PriceQuery {
    /// `YYYY-MM`; defaults to the current month
    pub month: Option<Month>,
}

// =============================================================================
// Handlers
// =============================================================================

pub async fn get_plan(
    State(state): State<AppState>,
    Path(plan_id): Path<Uuid>,
) -> ApiResult<Json<Plan>> {
    Ok(Json(state.billing.plans.get_plan(plan_id).await?))
}

pub async fn update_plan(
    State(state): State<AppState>,
    Path(plan_id): Path<Uuid>,
    Json(update): Json<PlanUpdate>,
) -> ApiResult<Json<PlanUpdateResponse>> {
    tracing::info!(
        plan_id = %plan_id,
        pricing_mode = ?update.pricing_mode,
        schedule_len = update.schedule.as_ref().map(Vec::len),
        "Plan update requested"
    );

    let result = state
        .billing
        .plans
        .update_plan(plan_id, update, OffsetDateTime::now_utc())
        .await?;

    Ok(Json(result.into()))
}

/// Resolve the plan's price for a month; "unavailable" is a normal answer
pub async fn get_price(
    State(state): State<AppState>,
    Path(plan_id): Path<Uuid>,
    Query(query): Query<PriceQuery>,
) -> ApiResult<Json<PriceResponse>> {
    let month = query
        .month
        .unwrap_or_else(|| Month::containing(OffsetDateTime::now_utc()));

    // 404 for unknown plans before resolving
    state.billing.plans.get_plan(plan_id).await?;

    match state.billing.prices.price_for_month(plan_id, month).await {
        Ok(item) => Ok(Json(PriceResponse::resolved(plan_id, month, item))),
        Err(BillingError::PriceUnavailable { .. }) => {
            Ok(Json(PriceResponse::unavailable(plan_id, month)))
        }
        Err(e) => Err(e.into()),
    }
}

/// Operator-triggered resume of subscriptions paused on this plan
pub async fn resume_plan(
    State(state): State<AppState>,
    Path(plan_id): Path<Uuid>,
) -> ApiResult<Json<ResumeResponse>> {
    let summary = state.billing.plans.resume(plan_id).await?;
    Ok(Json(summary.into()))
}
