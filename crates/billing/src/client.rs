//! Stripe client configuration

use std::sync::Arc;
use stripe::{AccountId, Client};

use crate::error::{BillingError, BillingResult};
use crate::processor::{PaymentProcessor, ProcessorFactory};
use crate::stripe_processor::StripeProcessor;

/// Default tolerance for webhook timestamps (5 minutes)
pub const DEFAULT_WEBHOOK_TOLERANCE_SECS: i64 = 300;

const MIN_WEBHOOK_SECRET_LEN: usize = 16;

/// Configuration for Stripe billing
#[derive(Debug, Clone)]
pub struct StripeConfig {
    /// Stripe secret API key
    pub secret_key: String,
    /// Stripe webhook signing secret
    pub webhook_secret: String,
    /// Maximum age of a signed webhook timestamp
    pub webhook_tolerance_secs: i64,
    /// REST base used for calls async-stripe cannot express
    pub api_base: String,
}

impl StripeConfig {
    /// Create config from environment variables
    pub fn from_env() -> BillingResult<Self> {
        let webhook_secret = std::env::var("STRIPE_WEBHOOK_SECRET")
            .map_err(|_| BillingError::Config("STRIPE_WEBHOOK_SECRET not set".to_string()))?;
        if webhook_secret.len() < MIN_WEBHOOK_SECRET_LEN {
            return Err(BillingError::Config(format!(
                "STRIPE_WEBHOOK_SECRET must be at least {} characters",
                MIN_WEBHOOK_SECRET_LEN
            )));
        }

        let webhook_tolerance_secs = match std::env::var("STRIPE_WEBHOOK_TOLERANCE_SECS") {
            Ok(raw) => raw.parse().map_err(|_| {
                BillingError::Config(format!("STRIPE_WEBHOOK_TOLERANCE_SECS is not a number: {}", raw))
            })?,
            Err(_) => DEFAULT_WEBHOOK_TOLERANCE_SECS,
        };

        Ok(Self {
            secret_key: std::env::var("STRIPE_SECRET_KEY")
                .map_err(|_| BillingError::Config("STRIPE_SECRET_KEY not set".to_string()))?,
            webhook_secret,
            webhook_tolerance_secs,
            api_base: std::env::var("STRIPE_API_BASE")
                .unwrap_or_else(|_| "https://api.stripe.com".to_string()),
        })
    }
}

/// Stripe billing client
#[derive(Clone)]
pub struct StripeClient {
    client: Client,
    http: reqwest::Client,
    config: StripeConfig,
}

impl StripeClient {
    /// Create a new Stripe client from config
    pub fn new(config: StripeConfig) -> Self {
        let client = Client::new(&config.secret_key);
        Self {
            client,
            http: reqwest::Client::new(),
            config,
        }
    }

    /// Create a new Stripe client from environment variables
    pub fn from_env() -> BillingResult<Self> {
        let config = StripeConfig::from_env()?;
        Ok(Self::new(config))
    }

    /// Get the inner Stripe client
    pub fn inner(&self) -> &Client {
        &self.client
    }

    /// Get the config
    pub fn config(&self) -> &StripeConfig {
        &self.config
    }
}

impl ProcessorFactory for StripeClient {
    fn for_account(&self, account_id: Option<&str>) -> Arc<dyn PaymentProcessor> {
        let (scoped, account) = match account_id.map(|id| (id, id.parse::<AccountId>())) {
            Some((raw, Ok(account))) => (
                self.client.clone().with_stripe_account(account),
                Some(raw.to_string()),
            ),
            Some((raw, Err(e))) => {
                tracing::warn!(
                    account_id = %raw,
                    error = %e,
                    "Invalid connected account id, using platform account"
                );
                (self.client.clone(), None)
            }
            None => (self.client.clone(), None),
        };

        Arc::new(StripeProcessor::new(
            scoped,
            self.http.clone(),
            self.config.secret_key.clone(),
            self.config.api_base.clone(),
            account,
        ))
    }
}
