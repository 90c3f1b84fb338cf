//! Memberpass API Library
//!
//! HTTP surface of the billing engine: the Stripe webhook endpoint and the
//! operator endpoints for plans, price resolution, resume, event replay,
//! onboarding and alerts.

#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod auth;
pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
