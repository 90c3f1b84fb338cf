//! API routes

pub mod alerts;
pub mod events;
pub mod health;
pub mod onboarding;
pub mod plans;
pub mod webhooks;

use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::{auth::require_operator, state::AppState};

/// Stripe payloads are small; this bounds what the raw-body extractor buffers
const WEBHOOK_BODY_LIMIT: usize = 1024 * 1024;

/// Create all API routes
pub fn create_router(state: AppState) -> Router {
    // Health check routes (at root level for infrastructure monitoring)
    let health_routes = Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness));

    // Stripe authenticates with the payload signature, not a bearer token
    let webhook_routes = Router::new()
        .route("/webhooks/stripe", post(webhooks::stripe_webhook))
        .layer(DefaultBodyLimit::max(WEBHOOK_BODY_LIMIT));

    // Operator routes
    let operator_routes = Router::new()
        .route("/plans/:plan_id", get(plans::get_plan).patch(plans::update_plan))
        .route("/plans/:plan_id/price", get(plans::get_price))
        .route("/plans/:plan_id/resume", post(plans::resume_plan))
        .route("/events/:event_id/replay", post(events::replay_event))
        .route("/alerts", get(alerts::list_open_alerts))
        .route(
            "/businesses/:business_id/onboarding",
            get(onboarding::get_onboarding),
        )
        .route(
            "/businesses/:business_id/onboarding/transitions",
            post(onboarding::request_transition),
        )
        .route_layer(middleware::from_fn_with_state(state.clone(), require_operator));

    // Combine all routes
    Router::new()
        .merge(health_routes)
        .merge(webhook_routes)
        .merge(operator_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
