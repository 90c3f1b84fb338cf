//! Switching a plan between FIXED and DYNAMIC pricing

use memberpass_shared::{MinorUnits, Month};
use std::sync::Arc;
use time::OffsetDateTime;

use crate::audit::{ActorType, AuditEntryBuilder, AuditEventType, AuditLogger};
use crate::error::{BillingError, BillingResult};
use crate::models::{MonthlyPrice, Plan, PriceQueueItem, PricingMode};
use crate::price_queue::{mint_price, retire_price, validate_schedule};
use crate::processor::{self, ProcessorFactory};
use crate::store::BillingStore;

#[derive(Debug, Clone, PartialEq)]
pub struct DynamicMigrationReport {
    pub price_id: String,
    pub applied_month: Month,
    /// Future months queued unapplied
    pub queued: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionFailure {
    pub stripe_subscription_id: String,
    pub error: String,
}

/// Per-subscription results of a move to FIXED.
///
/// `updated + failed.len() == considered` always holds.
#[derive(Debug, Clone, PartialEq)]
pub struct FixedMigrationReport {
    pub price_id: String,
    pub considered: usize,
    pub updated: usize,
    pub failed: Vec<SubscriptionFailure>,
    /// Unapplied queue items archived
    pub archived: u64,
}

pub struct PricingMigration {
    store: Arc<dyn BillingStore>,
    processors: Arc<dyn ProcessorFactory>,
    audit: AuditLogger,
}

impl PricingMigration {
    pub fn new(
        store: Arc<dyn BillingStore>,
        processors: Arc<dyn ProcessorFactory>,
        audit: AuditLogger,
    ) -> Self {
        Self {
            store,
            processors,
            audit,
        }
    }

    /// FIXED to DYNAMIC.
    ///
    /// Existing subscriptions keep their price until their next renewal sync.
    pub async fn to_dynamic(
        &self,
        plan: &mut Plan,
        schedule: &[MonthlyPrice],
        now: OffsetDateTime,
    ) -> BillingResult<DynamicMigrationReport> {
        if plan.pricing_mode == PricingMode::Dynamic {
            return Err(BillingError::InvalidInput(format!(
                "plan {} is already dynamic",
                plan.id
            )));
        }
        if schedule.is_empty() {
            return Err(BillingError::InvalidInput(
                "a dynamic plan needs a non-empty price schedule".to_string(),
            ));
        }
        validate_schedule(schedule)?;

        let current_month = Month::containing(now);
        let current = schedule
            .iter()
            .find(|entry| entry.month == current_month)
            .ok_or_else(|| {
                BillingError::InvalidInput(format!(
                    "schedule must include the current month {}",
                    current_month
                ))
            })?;
        if let Some(past) = schedule.iter().find(|entry| entry.month < current_month) {
            return Err(BillingError::InvalidInput(format!(
                "cannot schedule a price for past month {}",
                past.month
            )));
        }

        let processor =
            processor::processor_for_business(self.store.as_ref(), self.processors.as_ref(), plan.business_id)
                .await?;
        let price_id = mint_price(
            processor.as_ref(),
            plan,
            &current_month.to_string(),
            current.price_cents,
        )
        .await?;

        self.store.delete_pending_queue_items(plan.id).await?;

        let items: Vec<PriceQueueItem> = schedule
            .iter()
            .map(|entry| {
                let mut item = PriceQueueItem::pending(plan.id, entry.month, entry.price_cents);
                if entry.month == current_month {
                    item.applied = true;
                    item.stripe_price_id = Some(price_id.clone());
                }
                item
            })
            .collect();
        self.store.insert_queue_items(&items).await?;

        let previous = plan.stripe_price_id.replace(price_id.clone());
        plan.pricing_mode = PricingMode::Dynamic;
        plan.base_price = None;
        plan.updated_at = now;
        self.store.save_plan(plan).await?;

        if let Some(previous) = previous.as_deref() {
            retire_price(processor.as_ref(), previous).await;
        }

        let report = DynamicMigrationReport {
            price_id,
            applied_month: current_month,
            queued: items.len() - 1,
        };

        tracing::info!(
            plan_id = %plan.id,
            price_id = %report.price_id,
            queued = report.queued,
            "Migrated plan to dynamic pricing"
        );

        let entry = AuditEntryBuilder::new(AuditEventType::MigratedToDynamic, "plan", plan.id.to_string())
            .business(plan.business_id)
            .actor_type(ActorType::Operator)
            .data(serde_json::json!({
                "price_id": report.price_id,
                "previous_price_id": previous,
                "months": schedule.iter().map(|e| e.month.to_string()).collect::<Vec<_>>(),
            }))
            .build();
        self.audit.log_best_effort(entry).await;

        Ok(report)
    }

    /// DYNAMIC to FIXED.
    ///
    /// Every billable subscription is moved to the new price without
    /// proration. A failed swap is recorded and the batch continues.
    pub async fn to_fixed(
        &self,
        plan: &mut Plan,
        base_price: Option<MinorUnits>,
        now: OffsetDateTime,
    ) -> BillingResult<FixedMigrationReport> {
        if plan.pricing_mode == PricingMode::Fixed {
            return Err(BillingError::InvalidInput(format!(
                "plan {} is already fixed",
                plan.id
            )));
        }
        let base_price = base_price.ok_or_else(|| {
            BillingError::InvalidInput("a fixed plan needs a base price".to_string())
        })?;

        let processor =
            processor::processor_for_business(self.store.as_ref(), self.processors.as_ref(), plan.business_id)
                .await?;
        let price_id = mint_price(processor.as_ref(), plan, "base", base_price).await?;

        let subscriptions: Vec<_> = self
            .store
            .list_plan_subscriptions(plan.id)
            .await?
            .into_iter()
            .filter(|s| s.is_billable())
            .collect();

        let mut updated = 0;
        let mut failed = Vec::new();
        for subscription in &subscriptions {
            let id = subscription.stripe_subscription_id();
            match processor.swap_subscription_price(id, &price_id).await {
                Ok(_) => updated += 1,
                Err(e) => {
                    tracing::warn!(
                        plan_id = %plan.id,
                        subscription_id = %id,
                        error = %e,
                        "Failed to move subscription to fixed price"
                    );
                    failed.push(SubscriptionFailure {
                        stripe_subscription_id: id.to_string(),
                        error: e.to_string(),
                    });
                }
            }
        }

        let archived = self.store.retire_pending_queue_items(plan.id, now).await?;

        let previous = plan.stripe_price_id.replace(price_id.clone());
        plan.pricing_mode = PricingMode::Fixed;
        plan.base_price = Some(base_price);
        plan.updated_at = now;
        self.store.save_plan(plan).await?;

        if let Some(previous) = previous.as_deref() {
            retire_price(processor.as_ref(), previous).await;
        }

        let report = FixedMigrationReport {
            price_id,
            considered: subscriptions.len(),
            updated,
            failed,
            archived,
        };

        tracing::info!(
            plan_id = %plan.id,
            considered = report.considered,
            updated = report.updated,
            failed = report.failed.len(),
            archived = report.archived,
            "Migrated plan to fixed pricing"
        );

        let entry = AuditEntryBuilder::new(AuditEventType::MigratedToFixed, "plan", plan.id.to_string())
            .business(plan.business_id)
            .actor_type(ActorType::Operator)
            .data(serde_json::json!({
                "price_id": report.price_id,
                "previous_price_id": previous,
                "base_price_cents": base_price.get(),
                "updated": report.updated,
                "failed": report.failed.iter().map(|f| &f.stripe_subscription_id).collect::<Vec<_>>(),
                "archived": report.archived,
            }))
            .build();
        self.audit.log_best_effort(entry).await;

        Ok(report)
    }

    /// New base price on a FIXED plan; subscribers convert at renewal
    pub async fn reprice_fixed(
        &self,
        plan: &mut Plan,
        base_price: MinorUnits,
        now: OffsetDateTime,
    ) -> BillingResult<String> {
        let processor =
            processor::processor_for_business(self.store.as_ref(), self.processors.as_ref(), plan.business_id)
                .await?;
        let price_id = mint_price(processor.as_ref(), plan, "base", base_price).await?;

        let old_cents = plan.base_price.map(MinorUnits::get);
        let previous = plan.stripe_price_id.replace(price_id.clone());
        plan.base_price = Some(base_price);
        plan.updated_at = now;
        self.store.save_plan(plan).await?;

        if let Some(previous) = previous.as_deref() {
            retire_price(processor.as_ref(), previous).await;
        }

        let entry = AuditEntryBuilder::new(AuditEventType::PriceChanged, "plan", plan.id.to_string())
            .business(plan.business_id)
            .actor_type(ActorType::Operator)
            .data(serde_json::json!({
                "old_cents": old_cents,
                "new_cents": base_price.get(),
                "old_price_id": previous,
                "new_price_id": price_id,
            }))
            .build();
        self.audit.log_best_effort(entry).await;

        Ok(price_id)
    }
}
