//! Subscription synchronization
//!
//! Reconciles processor subscription objects into internal records. While the
//! membership migration is in flight a subscription may live in the current
//! `subscriptions` table or in the legacy `memberships` table; lookups try the
//! current model first.
//!
//! Events arrive out of order, so an update for a subscription we have not
//! created yet is an expected race and is ignored. Only checkout completion
//! creates records.

use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::audit::{ActorType, AuditEntryBuilder, AuditEventType, AuditLogger};
use crate::error::{BillingError, BillingResult};
use crate::models::{
    Consumer, CurrentSubscription, SubscriptionRecord, SubscriptionSyncFields, CANCELED_STATUS,
};
use crate::notifications::Notifier;
use crate::processor::{ExternalSubscription, ProcessorFactory};
use crate::store::{self, BillingStore};

/// Why an event did not change any subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IgnoreReason {
    /// No record in either model yet
    UnknownSubscription(String),
    /// Checkout session that did not start a subscription
    NotASubscriptionCheckout(String),
}

impl fmt::Display for IgnoreReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownSubscription(id) => write!(f, "unknown subscription {}", id),
            Self::NotASubscriptionCheckout(id) => {
                write!(f, "checkout session {} has no subscription", id)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    Applied(SubscriptionRecord),
    Created(Uuid),
    Ignored(IgnoreReason),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CustomerDetails {
    #[serde(default)]
    pub email: Option<String>,
}

/// The parts of a completed checkout session the creation path reads
#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutSession {
    pub id: String,
    #[serde(default)]
    pub customer: Option<String>,
    #[serde(default)]
    pub customer_email: Option<String>,
    #[serde(default)]
    pub customer_details: Option<CustomerDetails>,
    #[serde(default)]
    pub subscription: Option<String>,
    #[serde(default)]
    pub metadata: Option<HashMap<String, String>>,
}

impl CheckoutSession {
    pub fn email(&self) -> Option<&str> {
        self.customer_details
            .as_ref()
            .and_then(|d| d.email.as_deref())
            .or(self.customer_email.as_deref())
    }

    pub fn plan_id(&self) -> BillingResult<Uuid> {
        let raw = self
            .metadata
            .as_ref()
            .and_then(|m| m.get("plan_id"))
            .ok_or_else(|| {
                BillingError::InvalidInput(format!(
                    "checkout session {} has no plan_id metadata",
                    self.id
                ))
            })?;
        raw.parse().map_err(|_| {
            BillingError::InvalidInput(format!(
                "checkout session {} has invalid plan_id metadata: {}",
                self.id, raw
            ))
        })
    }
}

fn from_epoch(secs: i64) -> BillingResult<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(secs)
        .map_err(|e| BillingError::WebhookPayloadInvalid(format!("invalid timestamp {}: {}", secs, e)))
}

/// Fields a processor subscription is allowed to overwrite
pub fn sync_fields(
    subscription: &ExternalSubscription,
    synced_at: OffsetDateTime,
) -> BillingResult<SubscriptionSyncFields> {
    Ok(SubscriptionSyncFields {
        status: subscription.status.clone(),
        current_period_start: from_epoch(subscription.current_period_start)?,
        current_period_end: from_epoch(subscription.current_period_end)?,
        cancel_at_period_end: subscription.cancel_at_period_end,
        synced_at,
    })
}

pub struct SubscriptionSynchronizer {
    store: Arc<dyn BillingStore>,
    processors: Arc<dyn ProcessorFactory>,
    notifier: Arc<dyn Notifier>,
    audit: AuditLogger,
}

impl SubscriptionSynchronizer {
    pub fn new(
        store: Arc<dyn BillingStore>,
        processors: Arc<dyn ProcessorFactory>,
        notifier: Arc<dyn Notifier>,
        audit: AuditLogger,
    ) -> Self {
        Self {
            store,
            processors,
            notifier,
            audit,
        }
    }

    /// Apply a subscription lifecycle update
    pub async fn sync(
        &self,
        subscription: &ExternalSubscription,
        account_id: Option<&str>,
        event_id: &str,
    ) -> BillingResult<SyncOutcome> {
        let Some(record) = store::find_subscription(self.store.as_ref(), &subscription.id).await?
        else {
            tracing::info!(
                subscription_id = %subscription.id,
                event_id = %event_id,
                "Update for unknown subscription, ignoring (created event not yet processed)"
            );
            return Ok(SyncOutcome::Ignored(IgnoreReason::UnknownSubscription(
                subscription.id.clone(),
            )));
        };

        let fields = sync_fields(subscription, OffsetDateTime::now_utc())?;

        if fields.current_period_start > record.current_period_start() {
            self.convert_renewal_price(&record, subscription, account_id, event_id)
                .await;
        }

        self.store.apply_subscription_sync(record.key(), &fields).await?;

        tracing::info!(
            subscription_id = %subscription.id,
            model = record.model(),
            status = %fields.status,
            event_id = %event_id,
            "Synced subscription"
        );

        let refreshed = store::find_subscription(self.store.as_ref(), &subscription.id)
            .await?
            .unwrap_or(record);
        Ok(SyncOutcome::Applied(refreshed))
    }

    /// Move a renewing subscription onto its plan's current price.
    ///
    /// Failures are logged and audited; the field sync still applies.
    async fn convert_renewal_price(
        &self,
        record: &SubscriptionRecord,
        subscription: &ExternalSubscription,
        account_id: Option<&str>,
        event_id: &str,
    ) {
        if subscription.paused || !record.is_billable() {
            return;
        }

        let plan = match self.store.get_plan(record.plan_id()).await {
            Ok(Some(plan)) => plan,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(
                    plan_id = %record.plan_id(),
                    error = %e,
                    "Could not load plan for renewal price conversion"
                );
                return;
            }
        };

        let Some(target_price) = plan.stripe_price_id.as_deref() else {
            return;
        };
        let current_price = subscription.first_item().map(|item| item.price_id.as_str());
        if current_price == Some(target_price) {
            return;
        }

        let processor = self.processors.for_account(account_id);
        let result = processor
            .swap_subscription_price(&subscription.id, target_price)
            .await;

        let (event_type, error) = match &result {
            Ok(_) => {
                tracing::info!(
                    subscription_id = %subscription.id,
                    from_price = ?current_price,
                    to_price = %target_price,
                    "Converted renewing subscription to current plan price"
                );
                (AuditEventType::RenewalPriceConverted, None)
            }
            Err(e) => {
                tracing::warn!(
                    subscription_id = %subscription.id,
                    to_price = %target_price,
                    error = %e,
                    "Renewal price conversion failed"
                );
                (AuditEventType::RenewalPriceConversionFailed, Some(e.to_string()))
            }
        };

        let entry = AuditEntryBuilder::new(event_type, "subscription", subscription.id.clone())
            .business(plan.business_id)
            .stripe_event(event_id)
            .actor_type(ActorType::System)
            .data(serde_json::json!({
                "plan_id": plan.id,
                "pricing_mode": plan.pricing_mode.as_str(),
                "from_price": current_price,
                "to_price": target_price,
                "error": error,
            }))
            .build();
        self.audit.log_best_effort(entry).await;
    }

    /// Creation path, driven only by checkout completion
    pub async fn create_from_checkout(
        &self,
        session: &CheckoutSession,
        account_id: Option<&str>,
        event_id: &str,
    ) -> BillingResult<SyncOutcome> {
        let Some(subscription_id) = session.subscription.as_deref() else {
            tracing::info!(
                session_id = %session.id,
                event_id = %event_id,
                "Checkout session without subscription, ignoring"
            );
            return Ok(SyncOutcome::Ignored(IgnoreReason::NotASubscriptionCheckout(
                session.id.clone(),
            )));
        };

        let plan_id = session.plan_id()?;
        let plan = self
            .store
            .get_plan(plan_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("plan {}", plan_id)))?;

        let email = session.email().ok_or_else(|| {
            BillingError::InvalidInput(format!("checkout session {} has no customer email", session.id))
        })?;

        let consumer = match self
            .store
            .find_consumer_by_email(plan.business_id, email)
            .await?
        {
            Some(existing) => existing,
            None => {
                self.store
                    .upsert_consumer(&Consumer {
                        id: Uuid::new_v4(),
                        business_id: plan.business_id,
                        email: email.to_string(),
                        stripe_customer_id: session.customer.clone(),
                        created_at: OffsetDateTime::now_utc(),
                    })
                    .await?
            }
        };

        // Session payloads carry no period data; the processor is the source of truth
        let processor = self.processors.for_account(account_id);
        let external = processor.retrieve_subscription(subscription_id).await?;
        let now = OffsetDateTime::now_utc();
        let fields = sync_fields(&external, now)?;

        if let Some(existing) = store::find_subscription(self.store.as_ref(), subscription_id).await? {
            self.store.apply_subscription_sync(existing.key(), &fields).await?;
            tracing::info!(
                subscription_id = %subscription_id,
                model = existing.model(),
                event_id = %event_id,
                "Subscription already recorded, synced instead of creating"
            );
            return Ok(SyncOutcome::Applied(existing));
        }

        let record = CurrentSubscription {
            id: Uuid::new_v4(),
            stripe_subscription_id: subscription_id.to_string(),
            business_id: plan.business_id,
            consumer_id: consumer.id,
            plan_id: plan.id,
            status: fields.status.clone(),
            current_period_start: fields.current_period_start,
            current_period_end: fields.current_period_end,
            cancel_at_period_end: fields.cancel_at_period_end,
            paused_at: None,
            last_synced_at: Some(now),
            created_at: now,
        };

        if !self.store.insert_current_subscription(&record).await? {
            // Lost a race with a concurrent delivery; converge on the stored row
            if let Some(existing) = self.store.find_current_subscription(subscription_id).await? {
                let key = SubscriptionRecord::Current(existing.clone()).key();
                self.store.apply_subscription_sync(key, &fields).await?;
                return Ok(SyncOutcome::Applied(SubscriptionRecord::Current(existing)));
            }
        }

        tracing::info!(
            subscription_id = %subscription_id,
            plan_id = %plan.id,
            consumer_id = %consumer.id,
            event_id = %event_id,
            "Created subscription from checkout"
        );

        let entry = AuditEntryBuilder::new(
            AuditEventType::SubscriptionCreated,
            "subscription",
            subscription_id,
        )
        .business(plan.business_id)
        .stripe_event(event_id)
        .actor_type(ActorType::Stripe)
        .data(serde_json::json!({
            "plan_id": plan.id,
            "consumer_id": consumer.id,
            "status": record.status,
        }))
        .build();
        self.audit.log_best_effort(entry).await;

        Ok(SyncOutcome::Created(record.id))
    }

    /// Deletion path: terminal status plus a best-effort cancellation notice
    pub async fn handle_deleted(
        &self,
        subscription: &ExternalSubscription,
        event_id: &str,
    ) -> BillingResult<SyncOutcome> {
        let Some(record) = store::find_subscription(self.store.as_ref(), &subscription.id).await?
        else {
            tracing::info!(
                subscription_id = %subscription.id,
                event_id = %event_id,
                "Deletion for unknown subscription, ignoring"
            );
            return Ok(SyncOutcome::Ignored(IgnoreReason::UnknownSubscription(
                subscription.id.clone(),
            )));
        };

        self.store
            .set_subscription_status(record.key(), CANCELED_STATUS, OffsetDateTime::now_utc())
            .await?;

        let access_until = from_epoch(subscription.current_period_end)?.date();
        self.notify_cancelled(&record, access_until).await;

        let entry = AuditEntryBuilder::new(
            AuditEventType::SubscriptionCanceled,
            "subscription",
            subscription.id.clone(),
        )
        .business(record.business_id())
        .stripe_event(event_id)
        .actor_type(ActorType::Stripe)
        .data(serde_json::json!({
            "previous_status": record.status(),
            "access_until": access_until.to_string(),
            "model": record.model(),
        }))
        .build();
        self.audit.log_best_effort(entry).await;

        tracing::info!(
            subscription_id = %subscription.id,
            model = record.model(),
            event_id = %event_id,
            "Subscription canceled"
        );

        let refreshed = store::find_subscription(self.store.as_ref(), &subscription.id)
            .await?
            .unwrap_or(record);
        Ok(SyncOutcome::Applied(refreshed))
    }

    async fn notify_cancelled(&self, record: &SubscriptionRecord, access_until: time::Date) {
        let email = match record {
            SubscriptionRecord::Current(sub) => match self.store.get_consumer(sub.consumer_id).await {
                Ok(Some(consumer)) => Some(consumer.email),
                Ok(None) => None,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to load consumer for cancellation notice");
                    None
                }
            },
            SubscriptionRecord::Legacy(membership) => Some(membership.member_email.clone()),
        };

        let Some(email) = email else {
            tracing::warn!(
                subscription_id = %record.stripe_subscription_id(),
                "No email for cancellation notice"
            );
            return;
        };

        let plan_name = match self.store.get_plan(record.plan_id()).await {
            Ok(Some(plan)) => plan.name,
            _ => "your membership".to_string(),
        };

        match self
            .notifier
            .send_subscription_cancelled(&email, &plan_name, access_until)
            .await
        {
            Ok(true) => {}
            Ok(false) => tracing::warn!(
                subscription_id = %record.stripe_subscription_id(),
                "Cancellation notice not delivered"
            ),
            Err(e) => tracing::warn!(
                subscription_id = %record.stripe_subscription_id(),
                error = %e,
                "Cancellation notice failed"
            ),
        }
    }
}
