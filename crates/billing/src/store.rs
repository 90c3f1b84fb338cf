//! Billing persistence
//!
//! Every table the engine touches is reached through [`BillingStore`]. Writes
//! that can race with redelivered or reordered events are idempotent upserts
//! keyed by unique external ids, so no in-process locking is needed.

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::alerts::{Alert, AlertType};
use crate::audit::AuditEntry;
use crate::error::BillingResult;
use crate::models::{
    Business, Consumer, CurrentSubscription, InboundEvent, LegacySubscription,
    OnboardingTransition, Plan, PriceQueueItem, PricingMode, SubscriptionKey,
    SubscriptionRecord, SubscriptionSyncFields,
};
use crate::onboarding::OnboardingStatus;

pub mod memory;
pub mod postgres;

pub use memory::InMemoryBillingStore;
pub use postgres::PgBillingStore;

/// Result of recording an inbound event
#[derive(Debug, Clone, PartialEq)]
pub enum EventRecord {
    /// First delivery, row created
    Inserted(InboundEvent),
    /// Redelivery, the stored row is returned untouched
    Existing(InboundEvent),
}

impl EventRecord {
    pub fn event(&self) -> &InboundEvent {
        match self {
            Self::Inserted(e) | Self::Existing(e) => e,
        }
    }
}

#[async_trait]
pub trait BillingStore: Send + Sync {
    // ------------------------------------------------------------------
    // Inbound events
    // ------------------------------------------------------------------

    /// Insert the event unless a row with the same id exists
    async fn record_event(&self, event: &InboundEvent) -> BillingResult<EventRecord>;

    async fn get_event(&self, event_id: &str) -> BillingResult<Option<InboundEvent>>;

    /// Mark processed, clear any previous error and count the attempt
    async fn mark_event_processed(&self, event_id: &str, at: OffsetDateTime) -> BillingResult<()>;

    /// Record the handler error and count the attempt
    async fn mark_event_failed(&self, event_id: &str, error: &str) -> BillingResult<()>;

    /// Unprocessed events received before `older_than`, oldest first
    async fn list_failed_events(
        &self,
        older_than: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<Vec<InboundEvent>>;

    // ------------------------------------------------------------------
    // Businesses and onboarding
    // ------------------------------------------------------------------

    async fn get_business(&self, business_id: Uuid) -> BillingResult<Option<Business>>;

    async fn get_business_by_account(&self, account_id: &str) -> BillingResult<Option<Business>>;

    /// Set the status; `last_event_id` is only written when present
    async fn update_business_status(
        &self,
        business_id: Uuid,
        status: OnboardingStatus,
        last_event_id: Option<&str>,
    ) -> BillingResult<()>;

    async fn append_transition(&self, transition: &OnboardingTransition) -> BillingResult<()>;

    /// Oldest first
    async fn list_transitions(&self, business_id: Uuid) -> BillingResult<Vec<OnboardingTransition>>;

    // ------------------------------------------------------------------
    // Plans and price queue
    // ------------------------------------------------------------------

    async fn get_plan(&self, plan_id: Uuid) -> BillingResult<Option<Plan>>;

    async fn list_plans_by_mode(&self, mode: PricingMode) -> BillingResult<Vec<Plan>>;

    async fn save_plan(&self, plan: &Plan) -> BillingResult<()>;

    /// All items for the plan ordered by effective month
    async fn list_queue_items(&self, plan_id: Uuid) -> BillingResult<Vec<PriceQueueItem>>;

    /// Delete items that are neither applied nor archived
    async fn delete_pending_queue_items(&self, plan_id: Uuid) -> BillingResult<u64>;

    async fn insert_queue_items(&self, items: &[PriceQueueItem]) -> BillingResult<()>;

    async fn update_queue_item(&self, item: &PriceQueueItem) -> BillingResult<()>;

    /// Archive items that are neither applied nor archived
    async fn retire_pending_queue_items(&self, plan_id: Uuid, at: OffsetDateTime) -> BillingResult<u64>;

    // ------------------------------------------------------------------
    // Consumers
    // ------------------------------------------------------------------

    async fn get_consumer(&self, consumer_id: Uuid) -> BillingResult<Option<Consumer>>;

    async fn find_consumer_by_email(
        &self,
        business_id: Uuid,
        email: &str,
    ) -> BillingResult<Option<Consumer>>;

    /// Insert keyed on (business, email); returns the stored row
    async fn upsert_consumer(&self, consumer: &Consumer) -> BillingResult<Consumer>;

    // ------------------------------------------------------------------
    // Subscriptions (both models)
    // ------------------------------------------------------------------

    async fn find_current_subscription(
        &self,
        stripe_subscription_id: &str,
    ) -> BillingResult<Option<CurrentSubscription>>;

    async fn find_legacy_subscription(
        &self,
        stripe_subscription_id: &str,
    ) -> BillingResult<Option<LegacySubscription>>;

    /// Idempotent on the external subscription id; false when the row already existed
    async fn insert_current_subscription(&self, subscription: &CurrentSubscription) -> BillingResult<bool>;

    async fn apply_subscription_sync(
        &self,
        key: SubscriptionKey,
        fields: &SubscriptionSyncFields,
    ) -> BillingResult<()>;

    async fn set_subscription_status(
        &self,
        key: SubscriptionKey,
        status: &str,
        synced_at: OffsetDateTime,
    ) -> BillingResult<()>;

    async fn set_subscription_paused(
        &self,
        key: SubscriptionKey,
        paused_at: Option<OffsetDateTime>,
    ) -> BillingResult<()>;

    /// Every subscription of the plan across both models
    async fn list_plan_subscriptions(&self, plan_id: Uuid) -> BillingResult<Vec<SubscriptionRecord>>;

    // ------------------------------------------------------------------
    // Alerts and audit
    // ------------------------------------------------------------------

    async fn insert_alert(&self, alert: &Alert) -> BillingResult<()>;

    async fn resolve_alerts_for_subscriptions(
        &self,
        stripe_subscription_ids: &[String],
        alert_type: Option<AlertType>,
    ) -> BillingResult<u64>;

    async fn resolve_alerts_for_plan(&self, plan_id: Uuid, alert_type: AlertType) -> BillingResult<u64>;

    async fn find_open_alert(&self, plan_id: Uuid, alert_type: AlertType) -> BillingResult<Option<Alert>>;

    /// Newest first
    async fn list_open_alerts(&self) -> BillingResult<Vec<Alert>>;

    async fn insert_audit_entry(&self, entry: &AuditEntry) -> BillingResult<()>;
}

/// Look a subscription up in the current model first, then the legacy one
pub async fn find_subscription(
    store: &dyn BillingStore,
    stripe_subscription_id: &str,
) -> BillingResult<Option<SubscriptionRecord>> {
    if let Some(current) = store.find_current_subscription(stripe_subscription_id).await? {
        return Ok(Some(SubscriptionRecord::Current(current)));
    }
    Ok(store
        .find_legacy_subscription(stripe_subscription_id)
        .await?
        .map(SubscriptionRecord::Legacy))
}
