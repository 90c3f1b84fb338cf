//! Operator plan updates
//!
//! Every check runs before the first processor call, so a rejected update has
//! no external side effects.

use memberpass_shared::{MinorUnits, Month};
use serde::Deserialize;
use std::sync::Arc;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::alerts::{Alert, AlertService, AlertType};
use crate::audit::{ActorType, AuditEntryBuilder, AuditEventType, AuditLogger};
use crate::error::{BillingError, BillingResult};
use crate::models::{MonthlyPrice, Plan, PricingMode};
use crate::price_queue::{validate_schedule, PriceQueueService, ScheduleChange};
use crate::pricing_migration::{DynamicMigrationReport, FixedMigrationReport, PricingMigration};
use crate::resume::{ResumeEngine, ResumeSummary};
use crate::store::BillingStore;

/// Partial plan update; absent fields are left alone
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PlanUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub active: Option<bool>,
    #[serde(default)]
    pub pricing_mode: Option<PricingMode>,
    #[serde(default)]
    pub base_price: Option<MinorUnits>,
    #[serde(default)]
    pub schedule: Option<Vec<MonthlyPrice>>,
}

#[derive(Debug, Clone, Default)]
pub struct PlanUpdateResult {
    pub plan: Option<Plan>,
    pub schedule: Option<ScheduleChange>,
    pub to_dynamic: Option<DynamicMigrationReport>,
    pub to_fixed: Option<FixedMigrationReport>,
    pub new_base_price_id: Option<String>,
    /// Set when this update gave a priceless plan its current price
    pub resume: Option<ResumeSummary>,
}

pub struct PlanService {
    store: Arc<dyn BillingStore>,
    prices: PriceQueueService,
    migration: Arc<PricingMigration>,
    resume: Arc<ResumeEngine>,
    alerts: AlertService,
    audit: AuditLogger,
}

impl PlanService {
    pub fn new(
        store: Arc<dyn BillingStore>,
        prices: PriceQueueService,
        migration: Arc<PricingMigration>,
        resume: Arc<ResumeEngine>,
        alerts: AlertService,
        audit: AuditLogger,
    ) -> Self {
        Self {
            store,
            prices,
            migration,
            resume,
            alerts,
            audit,
        }
    }

    pub async fn get_plan(&self, plan_id: Uuid) -> BillingResult<Plan> {
        self.store
            .get_plan(plan_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("plan {}", plan_id)))
    }

    pub async fn update_plan(
        &self,
        plan_id: Uuid,
        update: PlanUpdate,
        now: OffsetDateTime,
    ) -> BillingResult<PlanUpdateResult> {
        let mut plan = self.get_plan(plan_id).await?;
        let current_month = Month::containing(now);
        let from_mode = plan.pricing_mode;
        let to_mode = update.pricing_mode.unwrap_or(from_mode);

        if let Some(name) = &update.name {
            if name.trim().is_empty() {
                return Err(BillingError::InvalidInput("plan name must not be empty".to_string()));
            }
        }
        if let Some(schedule) = &update.schedule {
            validate_schedule(schedule)?;
            if to_mode == PricingMode::Fixed {
                return Err(BillingError::InvalidInput(
                    "a fixed plan does not take a monthly schedule".to_string(),
                ));
            }
        }
        if update.base_price.is_some() && to_mode == PricingMode::Dynamic {
            return Err(BillingError::InvalidInput(
                "a dynamic plan is priced by its schedule, not a base price".to_string(),
            ));
        }

        let had_current_price = from_mode == PricingMode::Dynamic
            && self.prices.has_current_price(plan.id, now).await?;
        let schedule_covers_current = update
            .schedule
            .as_ref()
            .is_some_and(|s| s.iter().any(|entry| entry.month == current_month));

        // Activation covers switching an active plan to DYNAMIC as well
        let activating = update.active == Some(true)
            || (from_mode == PricingMode::Fixed && update.active.unwrap_or(plan.active));
        if to_mode == PricingMode::Dynamic && activating {
            let priced = if from_mode == PricingMode::Dynamic {
                had_current_price || schedule_covers_current
            } else {
                schedule_covers_current
            };
            if !priced {
                return Err(BillingError::InvalidInput(format!(
                    "cannot activate dynamic plan {} without a price for {}",
                    plan.id, current_month
                )));
            }
        }

        let mut result = PlanUpdateResult::default();

        match (from_mode, to_mode) {
            (PricingMode::Fixed, PricingMode::Dynamic) => {
                let schedule = update.schedule.as_deref().unwrap_or_default();
                result.to_dynamic = Some(self.migration.to_dynamic(&mut plan, schedule, now).await?);
            }
            (PricingMode::Dynamic, PricingMode::Fixed) => {
                result.to_fixed = Some(self.migration.to_fixed(&mut plan, update.base_price, now).await?);
            }
            (PricingMode::Dynamic, PricingMode::Dynamic) => {
                if let Some(schedule) = &update.schedule {
                    result.schedule = Some(self.prices.replace_schedule(&mut plan, schedule, now).await?);
                }
            }
            (PricingMode::Fixed, PricingMode::Fixed) => {
                if let Some(base_price) = update.base_price {
                    if plan.base_price != Some(base_price) {
                        result.new_base_price_id =
                            Some(self.migration.reprice_fixed(&mut plan, base_price, now).await?);
                    }
                }
            }
        }

        if let Some(name) = update.name.clone() {
            plan.name = name;
        }
        if let Some(active) = update.active {
            plan.active = active;
        }
        plan.updated_at = now;
        self.store.save_plan(&plan).await?;

        let entry = AuditEntryBuilder::new(AuditEventType::PlanUpdated, "plan", plan.id.to_string())
            .business(plan.business_id)
            .actor_type(ActorType::Operator)
            .data(serde_json::json!({
                "name": update.name,
                "active": update.active,
                "from_mode": from_mode.as_str(),
                "to_mode": to_mode.as_str(),
                "base_price_cents": update.base_price.map(MinorUnits::get),
                "schedule_months": update.schedule.as_ref().map(Vec::len),
            }))
            .build();
        self.audit.log_best_effort(entry).await;

        tracing::info!(
            plan_id = %plan.id,
            from_mode = %from_mode,
            to_mode = %to_mode,
            active = plan.active,
            "Plan updated"
        );

        // Rollover only pauses DYNAMIC plans, so only they can have been priceless
        let gained_price = from_mode == PricingMode::Dynamic
            && !had_current_price
            && match to_mode {
                PricingMode::Dynamic => self.prices.has_current_price(plan.id, now).await?,
                PricingMode::Fixed => plan.stripe_price_id.is_some(),
            };
        if gained_price {
            // The update itself is committed; a failed run is surfaced as an alert
            match self.resume_after_price(&plan).await {
                Ok(summary) => result.resume = Some(summary),
                Err(e) => {
                    tracing::error!(plan_id = %plan.id, error = %e, "Resume after price update failed");
                    let alert = Alert::new(
                        AlertType::ResumeFailures,
                        format!("Resume run failed for {}", plan.name),
                    )
                    .business(plan.business_id)
                    .plan(plan.id)
                    .metadata(serde_json::json!({ "error": e.to_string() }));
                    self.alerts.raise_best_effort(alert).await;
                }
            }
        }

        result.plan = Some(plan);
        Ok(result)
    }

    /// The plan just gained a current price: repair what rollover paused
    async fn resume_after_price(&self, plan: &Plan) -> BillingResult<ResumeSummary> {
        let summary = self.resume.resume_plan(plan.id).await?;

        if let Err(e) = self
            .alerts
            .resolve_for_plan(plan.id, AlertType::PlanMissingCurrentPrice)
            .await
        {
            tracing::warn!(plan_id = %plan.id, error = %e, "Failed to resolve missing price alert");
        }

        if summary.considered > 0 {
            let alert = Alert::new(
                AlertType::SubscriptionsAutoResumed,
                format!("Resumed {} paused subscriptions for {}", summary.resumed, plan.name),
            )
            .business(plan.business_id)
            .plan(plan.id)
            .metadata(serde_json::json!({
                "considered": summary.considered,
                "resumed": summary.resumed,
                "charged": summary.charged,
                "skipped": summary.skipped,
                "errors": summary.errors,
            }));
            self.alerts.raise_best_effort(alert).await;
        }

        if summary.errors > 0 {
            let failures: Vec<_> = summary
                .failures()
                .map(|item| {
                    serde_json::json!({
                        "subscription_id": item.stripe_subscription_id,
                        "outcome": format!("{:?}", item.outcome),
                    })
                })
                .collect();
            let alert = Alert::new(
                AlertType::ResumeFailures,
                format!("{} subscriptions failed to resume for {}", summary.errors, plan.name),
            )
            .business(plan.business_id)
            .plan(plan.id)
            .metadata(serde_json::json!({ "failures": failures }));
            self.alerts.raise_best_effort(alert).await;
        }

        Ok(summary)
    }

    /// Operator-triggered resume run
    pub async fn resume(&self, plan_id: Uuid) -> BillingResult<ResumeSummary> {
        let plan = self.get_plan(plan_id).await?;
        self.resume_after_price(&plan).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::onboarding::OnboardingStatus;
    use crate::store::memory::InMemoryBillingStore;
    use crate::testing::{InMemoryProcessorFactory, ProcessorOp, RecordingNotifier};

    struct Fixture {
        store: Arc<InMemoryBillingStore>,
        factory: InMemoryProcessorFactory,
        service: PlanService,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryBillingStore::new());
        let factory = InMemoryProcessorFactory::default();
        let processors: Arc<InMemoryProcessorFactory> = Arc::new(factory.clone());
        let audit = AuditLogger::new(store.clone());
        let alerts = AlertService::new(store.clone());
        let prices = PriceQueueService::new(store.clone(), processors.clone(), audit.clone());
        let resume = ResumeEngine::new(
            store.clone(),
            processors.clone(),
            prices.clone(),
            alerts.clone(),
            Arc::new(RecordingNotifier::new()),
            audit.clone(),
        );
        let service = PlanService::new(
            store.clone(),
            prices,
            Arc::new(PricingMigration::new(store.clone(), processors, audit.clone())),
            Arc::new(resume),
            alerts,
            audit,
        );
        Fixture {
            store,
            factory,
            service,
        }
    }

    fn now() -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }

    fn current(price: i64) -> MonthlyPrice {
        MonthlyPrice {
            month: Month::containing(now()),
            price_cents: MinorUnits::new(price).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_activating_dynamic_plan_without_price_is_rejected() {
        let f = fixture();
        let business = f.store.seed_business("Gym", OnboardingStatus::OnboardingComplete, None).await;
        let mut plan = f.store.seed_plan(business.id, "Flex", PricingMode::Dynamic, None).await;
        plan.active = false;
        f.store.save_plan(&plan).await.unwrap();

        let err = f
            .service
            .update_plan(
                plan.id,
                PlanUpdate {
                    active: Some(true),
                    ..Default::default()
                },
                now(),
            )
            .await
            .unwrap_err();

        assert!(err.is_validation());
        assert!(f.factory.processor().calls().is_empty());
        assert!(!f.store.get_plan(plan.id).await.unwrap().unwrap().active);
    }

    #[tokio::test]
    async fn test_schedule_on_fixed_plan_is_rejected() {
        let f = fixture();
        let business = f.store.seed_business("Gym", OnboardingStatus::OnboardingComplete, None).await;
        let plan = f
            .store
            .seed_plan(business.id, "Gold", PricingMode::Fixed, Some("price_a"))
            .await;

        let err = f
            .service
            .update_plan(
                plan.id,
                PlanUpdate {
                    schedule: Some(vec![current(4500)]),
                    ..Default::default()
                },
                now(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_setting_current_price_resumes_paused_plan() {
        let f = fixture();
        let business = f.store.seed_business("Gym", OnboardingStatus::OnboardingComplete, None).await;
        let plan = f.store.seed_plan(business.id, "Flex", PricingMode::Dynamic, None).await;
        let consumer = f.store.seed_consumer(business.id, "a@example.com").await;
        f.store
            .seed_current_subscription(&plan, consumer.id, "sub_1", "active", Some(now()))
            .await;
        f.factory
            .processor()
            .add_subscription("sub_1", "cus_1", "price_old", "active", true);
        f.store
            .insert_alert(&Alert::new(AlertType::PlanMissingCurrentPrice, "missing").plan(plan.id))
            .await
            .unwrap();

        let result = f
            .service
            .update_plan(
                plan.id,
                PlanUpdate {
                    schedule: Some(vec![current(4500)]),
                    ..Default::default()
                },
                now(),
            )
            .await
            .unwrap();

        let summary = result.resume.unwrap();
        assert_eq!(summary.resumed, 1);
        assert_eq!(summary.charged, 1);

        let open = f.store.list_open_alerts().await.unwrap();
        assert!(!open.iter().any(|a| a.alert_type == AlertType::PlanMissingCurrentPrice));
        assert!(open.iter().any(|a| a.alert_type == AlertType::SubscriptionsAutoResumed));
        assert_eq!(f.factory.processor().calls_for(ProcessorOp::FinalizeInvoice).len(), 1);
    }

    #[tokio::test]
    async fn test_fixed_price_on_priceless_dynamic_plan_resumes() {
        let f = fixture();
        let business = f.store.seed_business("Gym", OnboardingStatus::OnboardingComplete, None).await;
        let plan = f.store.seed_plan(business.id, "Flex", PricingMode::Dynamic, None).await;
        let consumer = f.store.seed_consumer(business.id, "p@example.com").await;
        f.store
            .seed_current_subscription(&plan, consumer.id, "sub_p", "active", Some(now()))
            .await;
        f.factory
            .processor()
            .add_subscription("sub_p", "cus_p", "price_old", "active", true);
        f.store
            .insert_alert(&Alert::new(AlertType::PlanMissingCurrentPrice, "missing").plan(plan.id))
            .await
            .unwrap();

        let result = f
            .service
            .update_plan(
                plan.id,
                PlanUpdate {
                    pricing_mode: Some(PricingMode::Fixed),
                    base_price: Some(MinorUnits::new(3900).unwrap()),
                    ..Default::default()
                },
                now(),
            )
            .await
            .unwrap();

        let summary = result.resume.unwrap();
        assert_eq!(summary.resumed, 1);
        assert_eq!(summary.charged, 1);

        let new_price = result.to_fixed.unwrap().price_id;
        let external = f.factory.processor().subscription("sub_p").unwrap();
        assert!(!external.paused);
        assert_eq!(external.items[0].price_id, new_price);
        let local = f.store.find_current_subscription("sub_p").await.unwrap().unwrap();
        assert!(local.paused_at.is_none());

        let invoices = f.factory.processor().invoices();
        assert_eq!(invoices.len(), 1);
        assert_eq!(invoices[0].amount_due, 3900);
        let open = f.store.list_open_alerts().await.unwrap();
        assert!(!open.iter().any(|a| a.alert_type == AlertType::PlanMissingCurrentPrice));
    }

    #[tokio::test]
    async fn test_rename_only_touches_nothing_external() {
        let f = fixture();
        let business = f.store.seed_business("Gym", OnboardingStatus::OnboardingComplete, None).await;
        let plan = f
            .store
            .seed_plan(business.id, "Gold", PricingMode::Fixed, Some("price_a"))
            .await;

        let result = f
            .service
            .update_plan(
                plan.id,
                PlanUpdate {
                    name: Some("Platinum".to_string()),
                    ..Default::default()
                },
                now(),
            )
            .await
            .unwrap();

        assert_eq!(result.plan.unwrap().name, "Platinum");
        assert!(result.resume.is_none());
        assert!(f.factory.processor().calls().is_empty());
    }
}
