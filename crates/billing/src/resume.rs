//! Subscription resume engine
//!
//! Repairs subscriptions that were auto-paused while their plan had no price.
//! Items are processed one at a time and a failure on one never stops the
//! rest. The timeout bounds the steps before and after the unpause separately,
//! so a stalled charge still leaves a `resume_charge_failed` alert behind.

use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::alerts::{Alert, AlertService, AlertType};
use crate::audit::{ActorType, AuditEntryBuilder, AuditEventType, AuditLogger};
use crate::error::{BillingError, BillingResult};
use crate::models::{Plan, PricingMode, SubscriptionRecord};
use crate::notifications::Notifier;
use crate::price_queue::PriceQueueService;
use crate::processor::{self, PaymentProcessor, ProcessorFactory};
use crate::store::BillingStore;

pub const DEFAULT_ITEM_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeItemOutcome {
    /// Pause removed and price swapped; `invoice_id` set when the catch-up charge went out
    Resumed { invoice_id: Option<String> },
    /// Processor no longer had it paused; local flag cleared
    Skipped,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeItem {
    pub stripe_subscription_id: String,
    pub outcome: ResumeItemOutcome,
}

/// `resumed + skipped + errors == considered`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeSummary {
    pub plan_id: Uuid,
    pub price_id: String,
    pub considered: usize,
    pub resumed: usize,
    /// Subset of `resumed` whose invoice was created and finalized
    pub charged: usize,
    pub skipped: usize,
    pub errors: usize,
    pub items: Vec<ResumeItem>,
}

impl ResumeSummary {
    fn new(plan_id: Uuid, price_id: String) -> Self {
        Self {
            plan_id,
            price_id,
            considered: 0,
            resumed: 0,
            charged: 0,
            skipped: 0,
            errors: 0,
            items: Vec::new(),
        }
    }

    fn record(&mut self, stripe_subscription_id: &str, outcome: ResumeItemOutcome) {
        self.considered += 1;
        match &outcome {
            ResumeItemOutcome::Resumed { invoice_id } => {
                self.resumed += 1;
                if invoice_id.is_some() {
                    self.charged += 1;
                }
            }
            ResumeItemOutcome::Skipped => self.skipped += 1,
            ResumeItemOutcome::Failed(_) => self.errors += 1,
        }
        self.items.push(ResumeItem {
            stripe_subscription_id: stripe_subscription_id.to_string(),
            outcome,
        });
    }

    pub fn failures(&self) -> impl Iterator<Item = &ResumeItem> {
        self.items
            .iter()
            .filter(|item| matches!(item.outcome, ResumeItemOutcome::Failed(_)))
    }
}

pub struct ResumeEngine {
    store: Arc<dyn BillingStore>,
    processors: Arc<dyn ProcessorFactory>,
    prices: PriceQueueService,
    alerts: AlertService,
    notifier: Arc<dyn Notifier>,
    audit: AuditLogger,
    item_timeout: Duration,
}

impl ResumeEngine {
    pub fn new(
        store: Arc<dyn BillingStore>,
        processors: Arc<dyn ProcessorFactory>,
        prices: PriceQueueService,
        alerts: AlertService,
        notifier: Arc<dyn Notifier>,
        audit: AuditLogger,
    ) -> Self {
        Self {
            store,
            processors,
            prices,
            alerts,
            notifier,
            audit,
            item_timeout: DEFAULT_ITEM_TIMEOUT,
        }
    }

    pub fn with_item_timeout(mut self, timeout: Duration) -> Self {
        self.item_timeout = timeout;
        self
    }

    /// Price paused subscriptions should move to
    async fn target_price(&self, plan: &Plan, now: OffsetDateTime) -> BillingResult<String> {
        match plan.pricing_mode {
            PricingMode::Dynamic => {
                let item = self.prices.current_price(plan.id, now).await?;
                item.stripe_price_id.ok_or_else(|| {
                    BillingError::Internal(format!("applied queue item {} has no price id", item.id))
                })
            }
            PricingMode::Fixed => plan.stripe_price_id.clone().ok_or_else(|| {
                BillingError::InvalidInput(format!("plan {} has no current price", plan.id))
            }),
        }
    }

    /// Resume every paused subscription of the plan
    pub async fn resume_plan(&self, plan_id: Uuid) -> BillingResult<ResumeSummary> {
        let plan = self
            .store
            .get_plan(plan_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("plan {}", plan_id)))?;

        let price_id = self.target_price(&plan, OffsetDateTime::now_utc()).await?;
        let processor =
            processor::processor_for_business(self.store.as_ref(), self.processors.as_ref(), plan.business_id)
                .await?;

        let paused: Vec<SubscriptionRecord> = self
            .store
            .list_plan_subscriptions(plan.id)
            .await?
            .into_iter()
            .filter(|s| s.is_paused())
            .collect();

        tracing::info!(
            plan_id = %plan.id,
            price_id = %price_id,
            paused = paused.len(),
            "Resuming paused subscriptions"
        );

        let mut summary = ResumeSummary::new(plan.id, price_id.clone());
        for record in &paused {
            let id = record.stripe_subscription_id();
            let outcome = match self.resume_one(processor.as_ref(), &plan, record, &price_id).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::warn!(subscription_id = %id, error = %e, "Resume failed");
                    ResumeItemOutcome::Failed(e.to_string())
                }
            };
            summary.record(id, outcome);
        }

        // Uncharged resumes keep their charge alert open
        let repaired: Vec<String> = summary
            .items
            .iter()
            .filter(|item| {
                matches!(
                    item.outcome,
                    ResumeItemOutcome::Skipped | ResumeItemOutcome::Resumed { invoice_id: Some(_) }
                )
            })
            .map(|item| item.stripe_subscription_id.clone())
            .collect();
        if !repaired.is_empty() {
            if let Err(e) = self.alerts.resolve_for_subscriptions(&repaired, None).await {
                tracing::warn!(plan_id = %plan.id, error = %e, "Failed to resolve alerts after resume");
            }
        }

        tracing::info!(
            plan_id = %plan.id,
            considered = summary.considered,
            resumed = summary.resumed,
            charged = summary.charged,
            skipped = summary.skipped,
            errors = summary.errors,
            "Resume run complete"
        );

        let entry = AuditEntryBuilder::new(AuditEventType::ResumeCompleted, "plan", plan.id.to_string())
            .business(plan.business_id)
            .actor_type(ActorType::System)
            .data(serde_json::json!({
                "price_id": summary.price_id,
                "considered": summary.considered,
                "resumed": summary.resumed,
                "charged": summary.charged,
                "skipped": summary.skipped,
                "errors": summary.errors,
            }))
            .build();
        self.audit.log_best_effort(entry).await;

        Ok(summary)
    }

    async fn resume_one(
        &self,
        processor: &dyn PaymentProcessor,
        plan: &Plan,
        record: &SubscriptionRecord,
        price_id: &str,
    ) -> BillingResult<ResumeItemOutcome> {
        let id = record.stripe_subscription_id();

        // The unpause itself is never cut short; after it the charge is either
        // sent or alerted
        let customer_id = match tokio::time::timeout(
            self.item_timeout,
            self.prepare(processor, record, price_id),
        )
        .await
        {
            Ok(Ok(Some(customer_id))) => customer_id,
            Ok(Ok(None)) => return Ok(ResumeItemOutcome::Skipped),
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(self.timed_out(id, "preparing resume")),
        };

        processor.resume_collection(id).await?;
        self.store.set_subscription_paused(record.key(), None).await?;

        let charge = match tokio::time::timeout(
            self.item_timeout,
            self.charge(processor, &customer_id, id),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(self.timed_out(id, "charging")),
        };
        let invoice_id = match charge {
            Ok(invoice_id) => Some(invoice_id),
            Err(e) => {
                tracing::warn!(subscription_id = %id, error = %e, "Catch-up invoice failed after resume");
                let alert = Alert::new(
                    AlertType::ResumeChargeFailed,
                    format!("Catch-up charge failed for resumed subscription {}", id),
                )
                .business(plan.business_id)
                .plan(plan.id)
                .subscription(id)
                .metadata(serde_json::json!({ "error": e.to_string(), "price_id": price_id }));
                self.alerts.raise_best_effort(alert).await;
                None
            }
        };

        self.notify_resumed(record, plan).await;

        tracing::info!(
            subscription_id = %id,
            price_id = %price_id,
            invoice_id = ?invoice_id,
            "Subscription resumed"
        );
        Ok(ResumeItemOutcome::Resumed { invoice_id })
    }

    /// Check the processor still has the pause and move the item to `price_id`.
    /// Returns the customer to charge, or `None` when there is nothing to resume.
    async fn prepare(
        &self,
        processor: &dyn PaymentProcessor,
        record: &SubscriptionRecord,
        price_id: &str,
    ) -> BillingResult<Option<String>> {
        let id = record.stripe_subscription_id();
        let external = processor.retrieve_subscription(id).await?;

        if !external.paused {
            self.store.set_subscription_paused(record.key(), None).await?;
            tracing::info!(subscription_id = %id, "Not paused at processor, cleared stale local pause");
            return Ok(None);
        }

        // Swap first so the catch-up invoice bills the new price
        let on_price = external.first_item().map(|item| item.price_id.as_str()) == Some(price_id);
        if !on_price {
            processor.swap_subscription_price(id, price_id).await?;
        }
        Ok(Some(external.customer_id))
    }

    fn timed_out(&self, subscription_id: &str, step: &str) -> BillingError {
        tracing::warn!(
            subscription_id = %subscription_id,
            step = step,
            timeout_secs = self.item_timeout.as_secs(),
            "Resume step timed out"
        );
        BillingError::Timeout(format!(
            "{} {} timed out after {}ms",
            step,
            subscription_id,
            self.item_timeout.as_millis()
        ))
    }

    async fn charge(
        &self,
        processor: &dyn PaymentProcessor,
        customer_id: &str,
        subscription_id: &str,
    ) -> BillingResult<String> {
        let invoice = processor.create_invoice(customer_id, subscription_id).await?;
        let finalized = processor.finalize_invoice(&invoice.id).await?;
        Ok(finalized.id)
    }

    async fn notify_resumed(&self, record: &SubscriptionRecord, plan: &Plan) {
        let email = match record {
            SubscriptionRecord::Current(sub) => match self.store.get_consumer(sub.consumer_id).await {
                Ok(consumer) => consumer.map(|c| c.email),
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to load consumer for resume notice");
                    None
                }
            },
            SubscriptionRecord::Legacy(membership) => Some(membership.member_email.clone()),
        };
        let Some(email) = email else {
            return;
        };

        match self.notifier.send_subscription_resumed(&email, &plan.name).await {
            Ok(true) => {}
            Ok(false) => tracing::warn!(
                subscription_id = %record.stripe_subscription_id(),
                "Resume notice not delivered"
            ),
            Err(e) => tracing::warn!(
                subscription_id = %record.stripe_subscription_id(),
                error = %e,
                "Resume notice failed"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MonthlyPrice, PriceQueueItem};
    use crate::onboarding::OnboardingStatus;
    use crate::store::memory::InMemoryBillingStore;
    use crate::testing::{InMemoryProcessorFactory, ProcessorOp, RecordingNotifier};
    use memberpass_shared::{MinorUnits, Month};

    struct Fixture {
        store: Arc<InMemoryBillingStore>,
        factory: InMemoryProcessorFactory,
        engine: ResumeEngine,
        plan: Plan,
        consumer_id: Uuid,
    }

    /// Dynamic plan with an applied price for the current month
    async fn fixture() -> Fixture {
        let store = Arc::new(InMemoryBillingStore::new());
        let factory = InMemoryProcessorFactory::default();
        let audit = AuditLogger::new(store.clone());
        let business = store
            .seed_business("Gym", OnboardingStatus::OnboardingComplete, Some("acct_gym"))
            .await;
        let mut plan = store
            .seed_plan(business.id, "Flex", PricingMode::Dynamic, None)
            .await;
        let prices = PriceQueueService::new(store.clone(), Arc::new(factory.clone()), audit.clone());
        prices
            .replace_schedule(
                &mut plan,
                &[MonthlyPrice {
                    month: Month::containing(OffsetDateTime::now_utc()),
                    price_cents: MinorUnits::new(4500).unwrap(),
                }],
                OffsetDateTime::now_utc(),
            )
            .await
            .unwrap();
        let consumer = store.seed_consumer(business.id, "a@example.com").await;
        let engine = ResumeEngine::new(
            store.clone(),
            Arc::new(factory.clone()),
            prices,
            AlertService::new(store.clone()),
            Arc::new(RecordingNotifier::new()),
            audit,
        );
        Fixture {
            store,
            factory,
            engine,
            plan,
            consumer_id: consumer.id,
        }
    }

    async fn paused(f: &Fixture, id: &str, paused_at_processor: bool) {
        f.store
            .seed_current_subscription(&f.plan, f.consumer_id, id, "active", Some(OffsetDateTime::now_utc()))
            .await;
        f.factory
            .processor()
            .add_subscription(id, "cus_1", "price_stale", "active", paused_at_processor);
    }

    #[tokio::test]
    async fn test_counts_add_up_across_outcomes() {
        let f = fixture().await;
        paused(&f, "sub_ok", true).await;
        paused(&f, "sub_stale", false).await;
        paused(&f, "sub_broken", true).await;
        f.factory
            .processor()
            .fail(ProcessorOp::ResumeCollection, Some("sub_broken"));

        let summary = f.engine.resume_plan(f.plan.id).await.unwrap();

        assert_eq!(summary.considered, 3);
        assert_eq!(summary.resumed, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.errors, 1);
        assert_eq!(summary.resumed + summary.skipped + summary.errors, summary.considered);

        let stale = f.store.find_current_subscription("sub_stale").await.unwrap().unwrap();
        assert!(stale.paused_at.is_none());
        let broken = f.store.find_current_subscription("sub_broken").await.unwrap().unwrap();
        assert!(broken.paused_at.is_some());
    }

    #[tokio::test]
    async fn test_invoice_failure_still_resumes() {
        let f = fixture().await;
        paused(&f, "sub_1", true).await;
        f.factory.processor().fail(ProcessorOp::FinalizeInvoice, None);

        let summary = f.engine.resume_plan(f.plan.id).await.unwrap();
        assert_eq!(summary.resumed, 1);
        assert_eq!(summary.charged, 0);

        let open = f.store.list_open_alerts().await.unwrap();
        assert!(open.iter().any(|a| a.alert_type == AlertType::ResumeChargeFailed));
    }

    #[tokio::test]
    async fn test_slow_item_times_out_without_blocking_batch() {
        let f = fixture().await;
        let f = Fixture {
            engine: f.engine.with_item_timeout(Duration::from_millis(50)),
            ..f
        };
        paused(&f, "sub_slow", true).await;
        paused(&f, "sub_fast", true).await;
        f.factory
            .processor()
            .delay("sub_slow", Duration::from_secs(5));

        let summary = f.engine.resume_plan(f.plan.id).await.unwrap();
        assert_eq!(summary.errors, 1);
        assert_eq!(summary.resumed, 1);
        let failed: Vec<_> = summary.failures().map(|i| i.stripe_subscription_id.as_str()).collect();
        assert_eq!(failed, vec!["sub_slow"]);
    }

    #[tokio::test]
    async fn test_stalled_charge_after_unpause_raises_alert() {
        let f = fixture().await;
        let f = Fixture {
            engine: f.engine.with_item_timeout(Duration::from_millis(50)),
            ..f
        };
        paused(&f, "sub_1", true).await;
        f.factory
            .processor()
            .stall(ProcessorOp::CreateInvoice, Duration::from_secs(5));

        let summary = f.engine.resume_plan(f.plan.id).await.unwrap();
        assert_eq!(summary.resumed, 1);
        assert_eq!(summary.charged, 0);
        assert_eq!(summary.errors, 0);

        assert!(!f.factory.processor().subscription("sub_1").unwrap().paused);
        let local = f.store.find_current_subscription("sub_1").await.unwrap().unwrap();
        assert!(local.paused_at.is_none());

        let open = f.store.list_open_alerts().await.unwrap();
        let charge_alert = open
            .iter()
            .find(|a| a.alert_type == AlertType::ResumeChargeFailed)
            .expect("charge alert raised");
        assert_eq!(charge_alert.stripe_subscription_id.as_deref(), Some("sub_1"));
    }

    #[tokio::test]
    async fn test_no_current_price_is_rejected() {
        let f = fixture().await;
        let plan = f
            .store
            .seed_plan(f.plan.business_id, "Empty", PricingMode::Dynamic, None)
            .await;
        f.store
            .insert_queue_items(&[PriceQueueItem::pending(
                plan.id,
                Month::containing(OffsetDateTime::now_utc()),
                MinorUnits::new(100).unwrap(),
            )])
            .await
            .unwrap();

        let err = f.engine.resume_plan(plan.id).await.unwrap_err();
        assert!(matches!(err, BillingError::PriceUnavailable { .. }));
    }
}
