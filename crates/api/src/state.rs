//! Application state

use memberpass_billing::BillingService;
use sqlx::PgPool;
use std::sync::Arc;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// `None` when the billing service runs on the in-memory store
    pub pool: Option<PgPool>,
    pub billing: Arc<BillingService>,
    /// Bearer token accepted on operator routes
    pub operator_token: Arc<str>,
}

impl AppState {
    pub fn new(pool: PgPool, billing: BillingService, operator_token: &str) -> Self {
        Self {
            pool: Some(pool),
            billing: Arc::new(billing),
            operator_token: Arc::from(operator_token),
        }
    }

    /// State without a database pool, for tests and local tooling
    pub fn detached(billing: BillingService, operator_token: &str) -> Self {
        Self {
            pool: None,
            billing: Arc::new(billing),
            operator_token: Arc::from(operator_token),
        }
    }
}
