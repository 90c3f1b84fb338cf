//! Routes verified events to the service that owns them

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;

use crate::alerts::{Alert, AlertService, AlertType};
use crate::error::{BillingError, BillingResult};
use crate::event_log::{EventEnvelope, EventHandler};
use crate::onboarding::{AccountCapabilities, OnboardingOutcome, OnboardingService};
use crate::processor::ExternalSubscription;
use crate::store::{self, BillingStore};
use crate::sync::{CheckoutSession, SubscriptionSynchronizer, SyncOutcome};

/// What the dispatcher did with an event
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Handled,
    /// Recognized type, nothing to change
    Ignored(String),
    /// No handler for this event type
    Unhandled,
}

/// The invoice fields payment alerts need
#[derive(Debug, Clone, Deserialize)]
struct InvoiceObject {
    id: String,
    #[serde(default)]
    subscription: Option<String>,
    #[serde(default)]
    customer: Option<String>,
    #[serde(default)]
    amount_due: Option<i64>,
    #[serde(default)]
    attempt_count: Option<i64>,
}

pub struct Dispatcher {
    store: Arc<dyn BillingStore>,
    sync: Arc<SubscriptionSynchronizer>,
    onboarding: Arc<OnboardingService>,
    alerts: AlertService,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn BillingStore>,
        sync: Arc<SubscriptionSynchronizer>,
        onboarding: Arc<OnboardingService>,
        alerts: AlertService,
    ) -> Self {
        Self {
            store,
            sync,
            onboarding,
            alerts,
        }
    }

    async fn handle_checkout_completed(&self, event: &EventEnvelope) -> BillingResult<DispatchOutcome> {
        let session: CheckoutSession = event.object_as()?;
        let outcome = self
            .sync
            .create_from_checkout(&session, event.account.as_deref(), &event.id)
            .await?;
        Ok(sync_outcome(outcome))
    }

    async fn handle_subscription_changed(&self, event: &EventEnvelope) -> BillingResult<DispatchOutcome> {
        let subscription: ExternalSubscription = event.object_as()?;
        let outcome = self
            .sync
            .sync(&subscription, event.account.as_deref(), &event.id)
            .await?;
        Ok(sync_outcome(outcome))
    }

    async fn handle_subscription_deleted(&self, event: &EventEnvelope) -> BillingResult<DispatchOutcome> {
        let subscription: ExternalSubscription = event.object_as()?;
        let outcome = self.sync.handle_deleted(&subscription, &event.id).await?;
        Ok(sync_outcome(outcome))
    }

    async fn handle_account_updated(&self, event: &EventEnvelope) -> BillingResult<DispatchOutcome> {
        let capabilities: AccountCapabilities = event.object_as()?;
        match self
            .onboarding
            .apply_account_update(&capabilities, &event.id)
            .await
        {
            Ok(OnboardingOutcome::Unchanged(status)) => {
                Ok(DispatchOutcome::Ignored(format!("onboarding status unchanged ({})", status)))
            }
            Ok(OnboardingOutcome::Transitioned { .. }) => Ok(DispatchOutcome::Handled),
            Err(BillingError::NotFound(what)) => {
                tracing::info!(
                    account_id = %capabilities.account_id,
                    event_id = %event.id,
                    "No business for connected account, ignoring"
                );
                Ok(DispatchOutcome::Ignored(format!("no {}", what)))
            }
            Err(e) => Err(e),
        }
    }

    async fn handle_invoice_payment_failed(&self, event: &EventEnvelope) -> BillingResult<DispatchOutcome> {
        let invoice: InvoiceObject = event.object_as()?;
        let Some(subscription_id) = invoice.subscription.as_deref() else {
            return Ok(DispatchOutcome::Ignored(format!(
                "invoice {} is not tied to a subscription",
                invoice.id
            )));
        };

        let mut alert = Alert::new(
            AlertType::PaymentFailed,
            format!("Payment failed for subscription {}", subscription_id),
        )
        .subscription(subscription_id)
        .metadata(serde_json::json!({
            "invoice_id": invoice.id,
            "customer_id": invoice.customer,
            "amount_due": invoice.amount_due,
            "attempt_count": invoice.attempt_count,
            "event_id": event.id,
        }));

        if let Some(record) = store::find_subscription(self.store.as_ref(), subscription_id).await? {
            alert = alert.business(record.business_id()).plan(record.plan_id());
        }

        self.alerts.raise(alert).await?;

        tracing::warn!(
            invoice_id = %invoice.id,
            subscription_id = %subscription_id,
            attempt_count = ?invoice.attempt_count,
            "Invoice payment failed"
        );

        Ok(DispatchOutcome::Handled)
    }

    async fn handle_invoice_paid(&self, event: &EventEnvelope) -> BillingResult<DispatchOutcome> {
        let invoice: InvoiceObject = event.object_as()?;
        let Some(subscription_id) = invoice.subscription else {
            return Ok(DispatchOutcome::Ignored(format!(
                "invoice {} is not tied to a subscription",
                invoice.id
            )));
        };

        let resolved = self
            .alerts
            .resolve_for_subscriptions(&[subscription_id.clone()], Some(AlertType::PaymentFailed))
            .await?;

        if resolved > 0 {
            tracing::info!(
                subscription_id = %subscription_id,
                resolved = resolved,
                "Resolved payment failure alerts after invoice paid"
            );
        }

        Ok(DispatchOutcome::Handled)
    }
}

fn sync_outcome(outcome: SyncOutcome) -> DispatchOutcome {
    match outcome {
        SyncOutcome::Applied(_) | SyncOutcome::Created(_) => DispatchOutcome::Handled,
        SyncOutcome::Ignored(reason) => DispatchOutcome::Ignored(reason.to_string()),
    }
}

#[async_trait]
impl EventHandler for Dispatcher {
    async fn handle(&self, event: &EventEnvelope) -> BillingResult<DispatchOutcome> {
        tracing::debug!(event_id = %event.id, event_type = %event.event_type, "Dispatching event");

        match event.event_type.as_str() {
            "checkout.session.completed" => self.handle_checkout_completed(event).await,

            // Subscription events
            "customer.subscription.created" | "customer.subscription.updated" => {
                self.handle_subscription_changed(event).await
            }
            "customer.subscription.deleted" => self.handle_subscription_deleted(event).await,

            // Connected account events
            "account.updated" => self.handle_account_updated(event).await,

            // Invoice events
            "invoice.payment_failed" => self.handle_invoice_payment_failed(event).await,
            "invoice.paid" => self.handle_invoice_paid(event).await,

            other => {
                tracing::info!(event_type = %other, event_id = %event.id, "Unhandled event type");
                Ok(DispatchOutcome::Unhandled)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditLogger;
    use crate::models::PricingMode;
    use crate::onboarding::OnboardingStatus;
    use crate::store::memory::InMemoryBillingStore;
    use crate::testing::{InMemoryProcessorFactory, RecordingNotifier};

    fn dispatcher() -> (Arc<InMemoryBillingStore>, Dispatcher) {
        let store = Arc::new(InMemoryBillingStore::new());
        let audit = AuditLogger::new(store.clone());
        let sync = SubscriptionSynchronizer::new(
            store.clone(),
            Arc::new(InMemoryProcessorFactory::default()),
            Arc::new(RecordingNotifier::new()),
            audit.clone(),
        );
        let dispatcher = Dispatcher::new(
            store.clone(),
            Arc::new(sync),
            Arc::new(OnboardingService::new(store.clone(), audit)),
            AlertService::new(store.clone()),
        );
        (store, dispatcher)
    }

    fn envelope(event_type: &str, object: serde_json::Value) -> EventEnvelope {
        EventEnvelope::parse(
            &serde_json::json!({
                "id": "evt_1",
                "type": event_type,
                "created": 1782864000,
                "data": { "object": object }
            })
            .to_string(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_unknown_type_is_unhandled() {
        let (_, dispatcher) = dispatcher();
        let outcome = dispatcher
            .handle(&envelope("customer.created", serde_json::json!({ "id": "cus_1" })))
            .await
            .unwrap();
        assert_eq!(outcome, DispatchOutcome::Unhandled);
    }

    #[tokio::test]
    async fn test_account_update_for_unknown_business_is_ignored() {
        let (_, dispatcher) = dispatcher();
        let outcome = dispatcher
            .handle(&envelope(
                "account.updated",
                serde_json::json!({ "id": "acct_missing", "charges_enabled": true }),
            ))
            .await
            .unwrap();
        assert!(matches!(outcome, DispatchOutcome::Ignored(_)));
    }

    #[tokio::test]
    async fn test_account_update_moves_onboarding() {
        let (store, dispatcher) = dispatcher();
        let business = store
            .seed_business("Gym", OnboardingStatus::OnboardingInProgress, Some("acct_1"))
            .await;

        let outcome = dispatcher
            .handle(&envelope(
                "account.updated",
                serde_json::json!({
                    "id": "acct_1",
                    "charges_enabled": true,
                    "details_submitted": true,
                    "payouts_enabled": true
                }),
            ))
            .await
            .unwrap();

        assert_eq!(outcome, DispatchOutcome::Handled);
        let business = store.get_business(business.id).await.unwrap().unwrap();
        assert_eq!(business.onboarding_status, OnboardingStatus::OnboardingComplete);
    }

    #[tokio::test]
    async fn test_payment_failure_alert_cycle() {
        let (store, dispatcher) = dispatcher();
        let business = store
            .seed_business("Gym", OnboardingStatus::OnboardingComplete, None)
            .await;
        let plan = store
            .seed_plan(business.id, "Gold", PricingMode::Fixed, Some("price_a"))
            .await;
        let consumer = store.seed_consumer(business.id, "a@example.com").await;
        store
            .seed_current_subscription(&plan, consumer.id, "sub_1", "active", None)
            .await;

        let invoice = serde_json::json!({
            "id": "in_1",
            "subscription": "sub_1",
            "customer": "cus_1",
            "amount_due": 2500,
            "attempt_count": 1
        });

        dispatcher
            .handle(&envelope("invoice.payment_failed", invoice.clone()))
            .await
            .unwrap();
        let open = store.list_open_alerts().await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].alert_type, AlertType::PaymentFailed);
        assert_eq!(open[0].plan_id, Some(plan.id));

        dispatcher
            .handle(&envelope("invoice.paid", invoice))
            .await
            .unwrap();
        assert!(store.list_open_alerts().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_object_is_payload_error() {
        let (_, dispatcher) = dispatcher();
        let err = dispatcher
            .handle(&envelope(
                "customer.subscription.updated",
                serde_json::json!({ "id": 42 }),
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::WebhookPayloadInvalid(_)));
    }
}
