//! Dynamic price queue
//!
//! A DYNAMIC plan carries one queue item per calendar month. An item becomes
//! *applied* when an external price is minted for it; only applied, unarchived
//! items resolve. Resolution never falls back to an adjacent month.

use memberpass_shared::{MinorUnits, Month};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::audit::{ActorType, AuditEntryBuilder, AuditEventType, AuditLogger};
use crate::error::{BillingError, BillingResult};
use crate::models::{MonthlyPrice, Plan, PriceQueueItem};
use crate::processor::{self, NewPrice, PaymentProcessor, ProcessorFactory};
use crate::store::BillingStore;

/// The applied item in effect at `at`, if any.
///
/// Candidates are live items whose month is the half-open interval containing
/// `at`; ties go to the latest effective month, then the newest row.
pub fn resolve_price(items: &[PriceQueueItem], at: OffsetDateTime) -> Option<&PriceQueueItem> {
    let month = Month::containing(at);
    let (start, end) = month.interval();
    items
        .iter()
        .filter(|item| item.is_live())
        .filter(|item| {
            let effective = item.effective_month.start();
            effective >= start && effective < end
        })
        .max_by_key(|item| (item.effective_month, item.created_at))
}

/// Reject duplicate months in an operator schedule
pub fn validate_schedule(schedule: &[MonthlyPrice]) -> BillingResult<()> {
    let mut seen = HashSet::new();
    for entry in schedule {
        if !seen.insert(entry.month) {
            return Err(BillingError::InvalidInput(format!(
                "schedule lists {} more than once",
                entry.month
            )));
        }
    }
    Ok(())
}

/// Mint a monthly price on the plan's product
pub async fn mint_price(
    processor: &dyn PaymentProcessor,
    plan: &Plan,
    label: &str,
    amount: MinorUnits,
) -> BillingResult<String> {
    let mut metadata = HashMap::new();
    metadata.insert("plan_id".to_string(), plan.id.to_string());
    metadata.insert("label".to_string(), label.to_string());

    let price = processor
        .create_price(NewPrice {
            product_id: plan.stripe_product_id.clone(),
            unit_amount: amount,
            nickname: Some(format!("{} ({})", plan.name, label)),
            metadata,
        })
        .await?;
    Ok(price.id)
}

/// Deactivate a superseded price; failure leaves an orphan price, nothing more
pub async fn retire_price(processor: &dyn PaymentProcessor, price_id: &str) {
    if let Err(e) = processor.deactivate_price(price_id).await {
        tracing::warn!(
            price_id = %price_id,
            error = %e,
            "Failed to deactivate superseded price"
        );
    }
}

/// What a schedule edit changed
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScheduleChange {
    /// Unapplied items deleted before the schedule was recreated
    pub removed: u64,
    pub queued: Vec<Month>,
    /// Months whose applied price was replaced by a newly minted one
    pub repriced: Vec<Month>,
    /// Current month applied immediately because it had no live item
    pub applied: Option<Month>,
}

#[derive(Clone)]
pub struct PriceQueueService {
    store: Arc<dyn BillingStore>,
    processors: Arc<dyn ProcessorFactory>,
    audit: AuditLogger,
}

impl PriceQueueService {
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

    /// Applied item in effect at `at`, or `PriceUnavailable`
    pub async fn current_price(&self, plan_id: Uuid, at: OffsetDateTime) -> BillingResult<PriceQueueItem> {
        let items = self.store.list_queue_items(plan_id).await?;
        resolve_price(&items, at)
            .cloned()
            .ok_or(BillingError::PriceUnavailable {
                plan_id,
                month: Month::containing(at),
            })
    }

    pub async fn price_for_month(&self, plan_id: Uuid, month: Month) -> BillingResult<PriceQueueItem> {
        self.current_price(plan_id, month.start()).await
    }

    pub async fn has_current_price(&self, plan_id: Uuid, at: OffsetDateTime) -> BillingResult<bool> {
        match self.current_price(plan_id, at).await {
            Ok(_) => Ok(true),
            Err(BillingError::PriceUnavailable { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Replace every unapplied item with the submitted schedule.
    ///
    /// Applied items are kept. A changed price on an applied month mints a
    /// replacement price; a current month with no live item is applied at once.
    pub async fn replace_schedule(
        &self,
        plan: &mut Plan,
        schedule: &[MonthlyPrice],
        now: OffsetDateTime,
    ) -> BillingResult<ScheduleChange> {
        validate_schedule(schedule)?;

        let current_month = Month::containing(now);
        let items = self.store.list_queue_items(plan.id).await?;
        let live: HashMap<Month, &PriceQueueItem> = items
            .iter()
            .filter(|item| item.is_live())
            .map(|item| (item.effective_month, item))
            .collect();

        for entry in schedule {
            if entry.month >= current_month {
                continue;
            }
            let unchanged = live
                .get(&entry.month)
                .is_some_and(|item| item.price == entry.price_cents);
            if !unchanged {
                return Err(BillingError::InvalidInput(format!(
                    "cannot schedule a price for past month {}",
                    entry.month
                )));
            }
        }

        let processor =
            processor::processor_for_business(self.store.as_ref(), self.processors.as_ref(), plan.business_id)
                .await?;

        // Mint every new price before touching stored rows, so a processor
        // failure leaves the existing schedule as it was
        let mut repricing = Vec::new();
        let mut applying = None;
        let mut pending = Vec::new();
        for entry in schedule {
            if entry.month < current_month {
                continue;
            }
            match live.get(&entry.month) {
                Some(item) if item.price == entry.price_cents => {}
                Some(item) => {
                    let price_id =
                        mint_price(processor.as_ref(), plan, &entry.month.to_string(), entry.price_cents).await?;
                    repricing.push(((*item).clone(), entry.price_cents, price_id));
                }
                None if entry.month == current_month => {
                    let price_id =
                        mint_price(processor.as_ref(), plan, &entry.month.to_string(), entry.price_cents).await?;
                    applying = Some((
                        PriceQueueItem::pending(plan.id, entry.month, entry.price_cents),
                        price_id,
                    ));
                }
                None => pending.push(PriceQueueItem::pending(plan.id, entry.month, entry.price_cents)),
            }
        }

        let mut change = ScheduleChange {
            removed: self.store.delete_pending_queue_items(plan.id).await?,
            queued: pending.iter().map(|item| item.effective_month).collect(),
            ..Default::default()
        };
        self.store.insert_queue_items(&pending).await?;

        for (item, new_price, price_id) in repricing {
            let month = item.effective_month;
            self.commit_reprice(processor.as_ref(), plan, item, new_price, price_id)
                .await?;
            change.repriced.push(month);
        }
        if let Some((item, price_id)) = applying {
            let month = item.effective_month;
            self.store.insert_queue_items(std::slice::from_ref(&item)).await?;
            self.commit_applied(processor.as_ref(), plan, item, price_id).await?;
            change.applied = Some(month);
        }

        tracing::info!(
            plan_id = %plan.id,
            removed = change.removed,
            queued = change.queued.len(),
            repriced = change.repriced.len(),
            applied = ?change.applied,
            "Replaced price schedule"
        );

        let entry = AuditEntryBuilder::new(AuditEventType::ScheduleReplaced, "plan", plan.id.to_string())
            .business(plan.business_id)
            .actor_type(ActorType::Operator)
            .data(serde_json::json!({
                "removed": change.removed,
                "queued": change.queued.iter().map(Month::to_string).collect::<Vec<_>>(),
                "repriced": change.repriced.iter().map(Month::to_string).collect::<Vec<_>>(),
                "applied": change.applied.map(|m| m.to_string()),
            }))
            .build();
        self.audit.log_best_effort(entry).await;

        Ok(change)
    }

    /// Change the price of an applied item by minting a replacement
    pub async fn update_applied_price(
        &self,
        plan: &mut Plan,
        month: Month,
        new_price: MinorUnits,
    ) -> BillingResult<PriceQueueItem> {
        let item = self
            .store
            .list_queue_items(plan.id)
            .await?
            .into_iter()
            .find(|item| item.is_live() && item.effective_month == month)
            .ok_or(BillingError::PriceUnavailable {
                plan_id: plan.id,
                month,
            })?;

        let processor =
            processor::processor_for_business(self.store.as_ref(), self.processors.as_ref(), plan.business_id)
                .await?;
        let price_id =
            mint_price(processor.as_ref(), plan, &item.effective_month.to_string(), new_price).await?;
        self.commit_reprice(processor.as_ref(), plan, item, new_price, price_id)
            .await
    }

    /// Point an applied item at its freshly minted `price_id` and retire the old one
    async fn commit_reprice(
        &self,
        processor: &dyn PaymentProcessor,
        plan: &mut Plan,
        mut item: PriceQueueItem,
        new_price: MinorUnits,
        price_id: String,
    ) -> BillingResult<PriceQueueItem> {
        let old_price = item.price;
        let previous_price_id = item.stripe_price_id.clone();

        item.price = new_price;
        item.stripe_price_id = Some(price_id.clone());
        self.store.update_queue_item(&item).await?;

        let was_plan_price = previous_price_id.is_some() && plan.stripe_price_id == previous_price_id;
        if was_plan_price {
            plan.stripe_price_id = Some(price_id.clone());
            plan.updated_at = OffsetDateTime::now_utc();
            self.store.save_plan(plan).await?;
        }

        if let Some(previous) = previous_price_id.as_deref() {
            retire_price(processor, previous).await;
        }

        tracing::info!(
            plan_id = %plan.id,
            month = %item.effective_month,
            old_cents = old_price.get(),
            new_cents = new_price.get(),
            price_id = %price_id,
            "Repriced applied month"
        );

        let entry = AuditEntryBuilder::new(AuditEventType::PriceChanged, "plan", plan.id.to_string())
            .business(plan.business_id)
            .actor_type(ActorType::Operator)
            .data(serde_json::json!({
                "month": item.effective_month.to_string(),
                "old_cents": old_price.get(),
                "new_cents": new_price.get(),
                "old_price_id": previous_price_id,
                "new_price_id": price_id,
            }))
            .build();
        self.audit.log_best_effort(entry).await;

        Ok(item)
    }

    /// Apply the unapplied item for `month`, if one is queued
    pub async fn apply_month(&self, plan: &mut Plan, month: Month) -> BillingResult<Option<PriceQueueItem>> {
        let Some(item) = self
            .store
            .list_queue_items(plan.id)
            .await?
            .into_iter()
            .find(|item| item.is_pending() && item.effective_month == month)
        else {
            return Ok(None);
        };

        let processor =
            processor::processor_for_business(self.store.as_ref(), self.processors.as_ref(), plan.business_id)
                .await?;
        let price_id = mint_price(processor.as_ref(), plan, &item.effective_month.to_string(), item.price).await?;
        self.commit_applied(processor.as_ref(), plan, item, price_id)
            .await
            .map(Some)
    }

    /// Mark the item applied at `price_id` and point the plan at it
    async fn commit_applied(
        &self,
        processor: &dyn PaymentProcessor,
        plan: &mut Plan,
        mut item: PriceQueueItem,
        price_id: String,
    ) -> BillingResult<PriceQueueItem> {
        item.applied = true;
        item.stripe_price_id = Some(price_id.clone());
        self.store.update_queue_item(&item).await?;

        let previous = plan.stripe_price_id.replace(price_id.clone());
        plan.updated_at = OffsetDateTime::now_utc();
        self.store.save_plan(plan).await?;

        if let Some(previous) = previous.as_deref() {
            retire_price(processor, previous).await;
        }

        tracing::info!(
            plan_id = %plan.id,
            month = %item.effective_month,
            amount_cents = item.price.get(),
            price_id = %price_id,
            "Applied queued price"
        );

        let entry = AuditEntryBuilder::new(AuditEventType::PriceApplied, "plan", plan.id.to_string())
            .business(plan.business_id)
            .actor_type(ActorType::System)
            .data(serde_json::json!({
                "month": item.effective_month.to_string(),
                "amount_cents": item.price.get(),
                "price_id": price_id,
                "previous_price_id": previous,
            }))
            .build();
        self.audit.log_best_effort(entry).await;

        Ok(item)
    }
}
