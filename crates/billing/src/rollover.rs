//! Monthly price rollover for DYNAMIC plans
//!
//! Runs at the start of each month. A plan whose month has no applied price
//! after rollover gets its billable subscriptions paused so nobody is charged
//! a stale price; the resume engine undoes this once a price is set.

use memberpass_shared::Month;
use std::sync::Arc;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::alerts::{Alert, AlertService, AlertType};
use crate::audit::{ActorType, AuditEntryBuilder, AuditEventType, AuditLogger};
use crate::error::BillingResult;
use crate::models::{Plan, PricingMode};
use crate::price_queue::{resolve_price, PriceQueueService};
use crate::processor::{self, ProcessorFactory};
use crate::store::BillingStore;

/// Statuses rollover pauses; `paused` rows are already handled
const PAUSABLE_STATUSES: [&str; 2] = ["active", "trialing"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanRollover {
    AlreadyCurrent,
    Applied { price_id: Option<String> },
    MissingPrice { paused: usize, pause_failures: usize },
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RolloverReport {
    pub month: Month,
    pub plans: Vec<(Uuid, PlanRollover)>,
}

impl RolloverReport {
    pub fn count(&self, f: impl Fn(&PlanRollover) -> bool) -> usize {
        self.plans.iter().filter(|(_, outcome)| f(outcome)).count()
    }
}

pub struct MonthlyRollover {
    store: Arc<dyn BillingStore>,
    processors: Arc<dyn ProcessorFactory>,
    prices: PriceQueueService,
    alerts: AlertService,
    audit: AuditLogger,
}

impl MonthlyRollover {
    pub fn new(
        store: Arc<dyn BillingStore>,
        processors: Arc<dyn ProcessorFactory>,
        prices: PriceQueueService,
        alerts: AlertService,
        audit: AuditLogger,
    ) -> Self {
        Self {
            store,
            processors,
            prices,
            alerts,
            audit,
        }
    }

    pub async fn run(&self, now: OffsetDateTime) -> BillingResult<RolloverReport> {
        let month = Month::containing(now);
        let plans = self.store.list_plans_by_mode(PricingMode::Dynamic).await?;

        tracing::info!(month = %month, plans = plans.len(), "Starting monthly price rollover");

        let mut report = RolloverReport {
            month,
            plans: Vec::with_capacity(plans.len()),
        };
        for mut plan in plans {
            let outcome = match self.roll_plan(&mut plan, month, now).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::error!(plan_id = %plan.id, error = %e, "Rollover failed for plan");
                    PlanRollover::Failed(e.to_string())
                }
            };
            report.plans.push((plan.id, outcome));
        }

        tracing::info!(
            month = %month,
            applied = report.count(|o| matches!(o, PlanRollover::Applied { .. })),
            missing = report.count(|o| matches!(o, PlanRollover::MissingPrice { .. })),
            failed = report.count(|o| matches!(o, PlanRollover::Failed(_))),
            "Monthly price rollover complete"
        );

        Ok(report)
    }

    async fn roll_plan(
        &self,
        plan: &mut Plan,
        month: Month,
        now: OffsetDateTime,
    ) -> BillingResult<PlanRollover> {
        let items = self.store.list_queue_items(plan.id).await?;
        if resolve_price(&items, month.start()).is_some() {
            return Ok(PlanRollover::AlreadyCurrent);
        }

        if let Some(item) = self.prices.apply_month(plan, month).await? {
            return Ok(PlanRollover::Applied {
                price_id: item.stripe_price_id,
            });
        }

        tracing::warn!(plan_id = %plan.id, month = %month, "Dynamic plan has no price for the month");

        let alert = Alert::new(
            AlertType::PlanMissingCurrentPrice,
            format!("{} has no price for {}", plan.name, month),
        )
        .business(plan.business_id)
        .plan(plan.id)
        .metadata(serde_json::json!({ "month": month.to_string() }));
        self.alerts.raise_once_for_plan(alert).await?;

        self.pause_plan(plan, month, now).await
    }

    async fn pause_plan(&self, plan: &Plan, month: Month, now: OffsetDateTime) -> BillingResult<PlanRollover> {
        let targets: Vec<_> = self
            .store
            .list_plan_subscriptions(plan.id)
            .await?
            .into_iter()
            .filter(|s| !s.is_paused() && PAUSABLE_STATUSES.contains(&s.status()))
            .collect();
        if targets.is_empty() {
            return Ok(PlanRollover::MissingPrice {
                paused: 0,
                pause_failures: 0,
            });
        }

        let processor =
            processor::processor_for_business(self.store.as_ref(), self.processors.as_ref(), plan.business_id)
                .await?;

        let mut paused = Vec::new();
        let mut failures = 0;
        for record in &targets {
            let id = record.stripe_subscription_id();
            let result = match processor.pause_collection(id).await {
                Ok(()) => self.store.set_subscription_paused(record.key(), Some(now)).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => {
                    paused.push(id.to_string());
                    let entry = AuditEntryBuilder::new(AuditEventType::SubscriptionAutoPaused, "subscription", id)
                        .business(plan.business_id)
                        .actor_type(ActorType::System)
                        .data(serde_json::json!({ "plan_id": plan.id, "month": month.to_string() }))
                        .build();
                    self.audit.log_best_effort(entry).await;
                }
                Err(e) => {
                    failures += 1;
                    tracing::warn!(subscription_id = %id, error = %e, "Failed to auto-pause subscription");
                }
            }
        }

        if !paused.is_empty() || failures > 0 {
            let alert = Alert::new(
                AlertType::SubscriptionsAutoPaused,
                format!("Paused {} subscriptions on {} ({} failed)", paused.len(), plan.name, failures),
            )
            .business(plan.business_id)
            .plan(plan.id)
            .metadata(serde_json::json!({
                "month": month.to_string(),
                "paused": paused,
                "failures": failures,
            }));
            self.alerts.raise_best_effort(alert).await;
        }

        tracing::info!(
            plan_id = %plan.id,
            paused = paused.len(),
            failures = failures,
            "Auto-paused subscriptions on unpriced plan"
        );

        Ok(PlanRollover::MissingPrice {
            paused: paused.len(),
            pause_failures: failures,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PriceQueueItem;
    use crate::onboarding::OnboardingStatus;
    use crate::store::memory::InMemoryBillingStore;
    use crate::testing::{InMemoryProcessorFactory, ProcessorOp};
    use memberpass_shared::MinorUnits;
    use time::macros::datetime;

    fn setup() -> (Arc<InMemoryBillingStore>, InMemoryProcessorFactory, MonthlyRollover) {
        let store = Arc::new(InMemoryBillingStore::new());
        let factory = InMemoryProcessorFactory::default();
        let audit = AuditLogger::new(store.clone());
        let prices = PriceQueueService::new(store.clone(), Arc::new(factory.clone()), audit.clone());
        let rollover = MonthlyRollover::new(
            store.clone(),
            Arc::new(factory.clone()),
            prices,
            AlertService::new(store.clone()),
            audit,
        );
        (store, factory, rollover)
    }

    #[tokio::test]
    async fn test_applies_queued_month() {
        let (store, factory, rollover) = setup();
        let business = store.seed_business("Gym", OnboardingStatus::OnboardingComplete, None).await;
        let plan = store
            .seed_plan(business.id, "Flex", PricingMode::Dynamic, Some("price_june"))
            .await;
        let july = Month::new(2026, 7).unwrap();
        store
            .insert_queue_items(&[PriceQueueItem::pending(plan.id, july, MinorUnits::new(4500).unwrap())])
            .await
            .unwrap();

        let report = rollover.run(datetime!(2026-07-01 00:05 UTC)).await.unwrap();
        assert!(matches!(report.plans[0].1, PlanRollover::Applied { .. }));

        let stored = store.get_plan(plan.id).await.unwrap().unwrap();
        assert_ne!(stored.stripe_price_id.as_deref(), Some("price_june"));
        assert!(!factory.processor().price("price_june").unwrap().active);

        // Second run in the same month is a no-op
        let again = rollover.run(datetime!(2026-07-01 06:00 UTC)).await.unwrap();
        assert_eq!(again.plans[0].1, PlanRollover::AlreadyCurrent);
    }

    #[tokio::test]
    async fn test_missing_price_pauses_and_alerts_once() {
        let (store, factory, rollover) = setup();
        let business = store.seed_business("Gym", OnboardingStatus::OnboardingComplete, None).await;
        let plan = store.seed_plan(business.id, "Flex", PricingMode::Dynamic, None).await;
        let consumer = store.seed_consumer(business.id, "a@example.com").await;
        for (id, status) in [("sub_a", "active"), ("sub_t", "trialing"), ("sub_c", "canceled")] {
            store
                .seed_current_subscription(&plan, consumer.id, id, status, None)
                .await;
            factory
                .processor()
                .add_subscription(id, "cus_1", "price_old", status, false);
        }
        store
            .seed_legacy_subscription(&plan, "old@example.com", "sub_legacy", "active")
            .await;
        factory
            .processor()
            .add_subscription("sub_legacy", "cus_2", "price_old", "active", false);

        let report = rollover.run(datetime!(2026-07-01 00:05 UTC)).await.unwrap();
        assert_eq!(
            report.plans[0].1,
            PlanRollover::MissingPrice {
                paused: 3,
                pause_failures: 0
            }
        );
        assert_eq!(factory.processor().calls_for(ProcessorOp::PauseCollection).len(), 3);
        assert!(factory.processor().subscription("sub_legacy").unwrap().paused);

        rollover.run(datetime!(2026-07-01 06:00 UTC)).await.unwrap();
        let missing = store
            .list_open_alerts()
            .await
            .unwrap()
            .into_iter()
            .filter(|a| a.alert_type == AlertType::PlanMissingCurrentPrice)
            .count();
        assert_eq!(missing, 1);
        // Already paused rows are not paused again
        assert_eq!(factory.processor().calls_for(ProcessorOp::PauseCollection).len(), 3);
    }
}
