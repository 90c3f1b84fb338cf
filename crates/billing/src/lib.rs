// Billing crate clippy configuration
#![allow(clippy::result_large_err)] // BillingError carries processor error text
#![allow(clippy::too_many_arguments)] // Service constructors take every collaborator
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Memberpass Billing Engine
//!
//! Reconciles Stripe events into internal billing state and runs the pricing
//! workflows of a membership platform.
//!
//! ## Features
//!
//! - **Event Log**: Signature-verified, idempotent intake of Stripe webhooks
//! - **Subscription Sync**: Current and legacy subscription models kept in step with Stripe
//! - **Onboarding**: Connected-account readiness state machine with transition history
//! - **Dynamic Pricing**: Month-by-month price queue, schedule edits, rollover
//! - **Pricing Migration**: FIXED <-> DYNAMIC plan conversion
//! - **Resume**: Repair of subscriptions auto-paused while a plan had no price
//! - **Alerts & Audit**: Durable anomaly records and an immutable audit trail

pub mod alerts;
pub mod audit;
pub mod client;
pub mod dispatcher;
pub mod error;
pub mod event_log;
pub mod models;
pub mod notifications;
pub mod onboarding;
pub mod plans;
pub mod price_queue;
pub mod pricing_migration;
pub mod processor;
pub mod resume;
pub mod rollover;
pub mod store;
pub mod stripe_processor;
pub mod sync;
pub mod testing;

// Alerts
pub use alerts::{Alert, AlertService, AlertType, Severity};

// Audit
pub use audit::{ActorType, AuditEntry, AuditEntryBuilder, AuditEventType, AuditLogger};

// Client
pub use client::{StripeClient, StripeConfig};

// Dispatch
pub use dispatcher::{DispatchOutcome, Dispatcher};

// Error
pub use error::{BillingError, BillingResult};

// Event log
pub use event_log::{EventEnvelope, EventHandler, EventLog, ReceiveOutcome, WebhookVerifier};

// Models
pub use models::{
    Business, Consumer, CurrentSubscription, InboundEvent, LegacySubscription, MonthlyPrice,
    OnboardingTransition, Plan, PriceQueueItem, PricingMode, SubscriptionRecord,
};

// Notifications
pub use notifications::{EmailConfig, Notifier, ResendNotifier};

// Onboarding
pub use onboarding::{AccountCapabilities, OnboardingOutcome, OnboardingService, OnboardingStatus};

// Plans and pricing
pub use plans::{PlanService, PlanUpdate, PlanUpdateResult};
pub use price_queue::{PriceQueueService, ScheduleChange};
pub use pricing_migration::{DynamicMigrationReport, FixedMigrationReport, PricingMigration};

// Processor
pub use processor::{PaymentProcessor, ProcessorFactory};

// Resume and rollover
pub use resume::{ResumeEngine, ResumeItemOutcome, ResumeSummary};
pub use rollover::{MonthlyRollover, PlanRollover, RolloverReport};

// Store
pub use store::{BillingStore, InMemoryBillingStore, PgBillingStore};

// Sync
pub use sync::{SubscriptionSynchronizer, SyncOutcome};

use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;

/// Main billing service that combines all billing functionality
pub struct BillingService {
    pub store: Arc<dyn BillingStore>,
    pub events: EventLog,
    pub onboarding: Arc<OnboardingService>,
    pub prices: PriceQueueService,
    pub plans: PlanService,
    pub resume: Arc<ResumeEngine>,
    pub rollover: MonthlyRollover,
    pub alerts: AlertService,
    pub audit: AuditLogger,
}

impl BillingService {
    /// Create a billing service against Postgres and live Stripe
    pub fn from_env(pool: PgPool, resume_item_timeout: Duration) -> BillingResult<Self> {
        let stripe = StripeClient::from_env()?;
        let verifier = WebhookVerifier::new(
            stripe.config().webhook_secret.clone(),
            stripe.config().webhook_tolerance_secs,
        );

        Ok(Self::new(
            Arc::new(PgBillingStore::new(pool)),
            Arc::new(stripe),
            Arc::new(ResendNotifier::from_env()),
            verifier,
            resume_item_timeout,
        ))
    }

    /// Wire every service around explicit collaborators
    pub fn new(
        store: Arc<dyn BillingStore>,
        processors: Arc<dyn ProcessorFactory>,
        notifier: Arc<dyn Notifier>,
        verifier: WebhookVerifier,
        resume_item_timeout: Duration,
    ) -> Self {
        let audit = AuditLogger::new(store.clone());
        let alerts = AlertService::new(store.clone());
        let prices = PriceQueueService::new(store.clone(), processors.clone(), audit.clone());

        let onboarding = Arc::new(OnboardingService::new(store.clone(), audit.clone()));
        let sync = Arc::new(SubscriptionSynchronizer::new(
            store.clone(),
            processors.clone(),
            notifier.clone(),
            audit.clone(),
        ));
        let dispatcher = Dispatcher::new(store.clone(), sync, onboarding.clone(), alerts.clone());
        let events = EventLog::new(store.clone(), verifier, Arc::new(dispatcher));

        let resume = Arc::new(
            ResumeEngine::new(
                store.clone(),
                processors.clone(),
                prices.clone(),
                alerts.clone(),
                notifier,
                audit.clone(),
            )
            .with_item_timeout(resume_item_timeout),
        );
        let migration = Arc::new(PricingMigration::new(
            store.clone(),
            processors.clone(),
            audit.clone(),
        ));
        let plans = PlanService::new(
            store.clone(),
            prices.clone(),
            migration,
            resume.clone(),
            alerts.clone(),
            audit.clone(),
        );
        let rollover = MonthlyRollover::new(
            store.clone(),
            processors,
            prices.clone(),
            alerts.clone(),
            audit.clone(),
        );

        Self {
            store,
            events,
            onboarding,
            prices,
            plans,
            resume,
            rollover,
            alerts,
            audit,
        }
    }
}
