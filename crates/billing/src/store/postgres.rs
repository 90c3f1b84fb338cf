//! Postgres billing store

use async_trait::async_trait;
use memberpass_shared::{MinorUnits, Month};
use sqlx::PgPool;
use time::{Date, OffsetDateTime};
use uuid::Uuid;

use super::{BillingStore, EventRecord};
use crate::alerts::{Alert, AlertType};
use crate::audit::AuditEntry;
use crate::error::BillingResult;
use crate::models::{
    Business, Consumer, CurrentSubscription, InboundEvent, LegacySubscription,
    OnboardingTransition, Plan, PriceQueueItem, PricingMode, SubscriptionKey,
    SubscriptionRecord, SubscriptionSyncFields,
};
use crate::onboarding::OnboardingStatus;

#[derive(Clone)]
pub struct PgBillingStore {
    pool: PgPool,
}

impl PgBillingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

// =============================================================================
// Row types
// =============================================================================

#[derive(sqlx::FromRow)]
struct EventRow {
    id: String,
    event_type: String,
    payload: String,
    signature_valid: bool,
    account_id: Option<String>,
    processed: bool,
    processing_error: Option<String>,
    attempts: i32,
    created_at: OffsetDateTime,
    processed_at: Option<OffsetDateTime>,
}

impl From<EventRow> for InboundEvent {
    fn from(row: EventRow) -> Self {
        Self {
            id: row.id,
            event_type: row.event_type,
            payload: row.payload,
            signature_valid: row.signature_valid,
            account_id: row.account_id,
            processed: row.processed,
            processing_error: row.processing_error,
            attempts: row.attempts,
            created_at: row.created_at,
            processed_at: row.processed_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct BusinessRow {
    id: Uuid,
    name: String,
    onboarding_status: String,
    stripe_account_id: Option<String>,
    last_processed_event_id: Option<String>,
    updated_at: OffsetDateTime,
}

impl TryFrom<BusinessRow> for Business {
    type Error = crate::error::BillingError;

    fn try_from(row: BusinessRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            name: row.name,
            onboarding_status: row.onboarding_status.parse()?,
            stripe_account_id: row.stripe_account_id,
            last_processed_event_id: row.last_processed_event_id,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct TransitionRow {
    id: Uuid,
    business_id: Uuid,
    from_status: String,
    to_status: String,
    reason: String,
    source: String,
    source_event_id: Option<String>,
    created_at: OffsetDateTime,
}

impl TryFrom<TransitionRow> for OnboardingTransition {
    type Error = crate::error::BillingError;

    fn try_from(row: TransitionRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            business_id: row.business_id,
            from_status: row.from_status.parse()?,
            to_status: row.to_status.parse()?,
            reason: row.reason,
            source: row.source.parse()?,
            source_event_id: row.source_event_id,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct PlanRow {
    id: Uuid,
    business_id: Uuid,
    name: String,
    pricing_mode: String,
    base_price_cents: Option<i64>,
    stripe_product_id: String,
    stripe_price_id: Option<String>,
    active: bool,
    updated_at: OffsetDateTime,
}

impl TryFrom<PlanRow> for Plan {
    type Error = crate::error::BillingError;

    fn try_from(row: PlanRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            business_id: row.business_id,
            name: row.name,
            pricing_mode: row.pricing_mode.parse()?,
            base_price: row.base_price_cents.map(MinorUnits::new).transpose()?,
            stripe_product_id: row.stripe_product_id,
            stripe_price_id: row.stripe_price_id,
            active: row.active,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct QueueItemRow {
    id: Uuid,
    plan_id: Uuid,
    effective_month: Date,
    price_cents: i64,
    applied: bool,
    stripe_price_id: Option<String>,
    retired_at: Option<OffsetDateTime>,
    created_at: OffsetDateTime,
}

impl TryFrom<QueueItemRow> for PriceQueueItem {
    type Error = crate::error::BillingError;

    fn try_from(row: QueueItemRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            plan_id: row.plan_id,
            effective_month: Month::from_date(row.effective_month),
            price: MinorUnits::new(row.price_cents)?,
            applied: row.applied,
            stripe_price_id: row.stripe_price_id,
            retired_at: row.retired_at,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ConsumerRow {
    id: Uuid,
    business_id: Uuid,
    email: String,
    stripe_customer_id: Option<String>,
    created_at: OffsetDateTime,
}

impl From<ConsumerRow> for Consumer {
    fn from(row: ConsumerRow) -> Self {
        Self {
            id: row.id,
            business_id: row.business_id,
            email: row.email,
            stripe_customer_id: row.stripe_customer_id,
            created_at: row.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct CurrentSubscriptionRow {
    id: Uuid,
    stripe_subscription_id: String,
    business_id: Uuid,
    consumer_id: Uuid,
    plan_id: Uuid,
    status: String,
    current_period_start: OffsetDateTime,
    current_period_end: OffsetDateTime,
    cancel_at_period_end: bool,
    paused_at: Option<OffsetDateTime>,
    last_synced_at: Option<OffsetDateTime>,
    created_at: OffsetDateTime,
}

impl From<CurrentSubscriptionRow> for CurrentSubscription {
    fn from(row: CurrentSubscriptionRow) -> Self {
        Self {
            id: row.id,
            stripe_subscription_id: row.stripe_subscription_id,
            business_id: row.business_id,
            consumer_id: row.consumer_id,
            plan_id: row.plan_id,
            status: row.status,
            current_period_start: row.current_period_start,
            current_period_end: row.current_period_end,
            cancel_at_period_end: row.cancel_at_period_end,
            paused_at: row.paused_at,
            last_synced_at: row.last_synced_at,
            created_at: row.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct MembershipRow {
    id: Uuid,
    stripe_subscription_id: String,
    business_id: Uuid,
    member_email: String,
    plan_id: Uuid,
    stripe_status: String,
    period_start: OffsetDateTime,
    period_end: OffsetDateTime,
    cancel_at_period_end: bool,
    paused_at: Option<OffsetDateTime>,
    synced_at: Option<OffsetDateTime>,
    created_at: OffsetDateTime,
}

impl From<MembershipRow> for LegacySubscription {
    fn from(row: MembershipRow) -> Self {
        Self {
            id: row.id,
            stripe_subscription_id: row.stripe_subscription_id,
            business_id: row.business_id,
            member_email: row.member_email,
            plan_id: row.plan_id,
            stripe_status: row.stripe_status,
            period_start: row.period_start,
            period_end: row.period_end,
            cancel_at_period_end: row.cancel_at_period_end,
            paused_at: row.paused_at,
            synced_at: row.synced_at,
            created_at: row.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct AlertRow {
    id: Uuid,
    alert_type: String,
    severity: String,
    business_id: Option<Uuid>,
    plan_id: Option<Uuid>,
    stripe_subscription_id: Option<String>,
    title: String,
    metadata: serde_json::Value,
    resolved: bool,
    resolved_at: Option<OffsetDateTime>,
    created_at: OffsetDateTime,
}

impl TryFrom<AlertRow> for Alert {
    type Error = crate::error::BillingError;

    fn try_from(row: AlertRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            alert_type: row.alert_type.parse()?,
            severity: row.severity.parse()?,
            business_id: row.business_id,
            plan_id: row.plan_id,
            stripe_subscription_id: row.stripe_subscription_id,
            title: row.title,
            metadata: row.metadata,
            resolved: row.resolved,
            resolved_at: row.resolved_at,
            created_at: row.created_at,
        })
    }
}

const EVENT_COLUMNS: &str = "id, event_type, payload, signature_valid, account_id, processed, \
     processing_error, attempts, created_at, processed_at";

const SUBSCRIPTION_COLUMNS: &str = "id, stripe_subscription_id, business_id, consumer_id, plan_id, \
     status, current_period_start, current_period_end, cancel_at_period_end, paused_at, \
     last_synced_at, created_at";

const MEMBERSHIP_COLUMNS: &str = "id, stripe_subscription_id, business_id, member_email, plan_id, \
     stripe_status, period_start, period_end, cancel_at_period_end, paused_at, synced_at, created_at";

const ALERT_COLUMNS: &str = "id, alert_type, severity, business_id, plan_id, stripe_subscription_id, \
     title, metadata, resolved, resolved_at, created_at";

const PLAN_COLUMNS: &str = "id, business_id, name, pricing_mode, base_price_cents, \
     stripe_product_id, stripe_price_id, active, updated_at";

const QUEUE_COLUMNS: &str = "id, plan_id, effective_month, price_cents, applied, stripe_price_id, \
     retired_at, created_at";

#[async_trait]
impl BillingStore for PgBillingStore {
    async fn record_event(&self, event: &InboundEvent) -> BillingResult<EventRecord> {
        // Atomic claim: only the first delivery inserts
        let inserted: Option<EventRow> = sqlx::query_as(&format!(
            r#"
            INSERT INTO stripe_events (id, event_type, payload, signature_valid, account_id, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO NOTHING
            RETURNING {EVENT_COLUMNS}
            "#
        ))
        .bind(&event.id)
        .bind(&event.event_type)
        .bind(&event.payload)
        .bind(event.signature_valid)
        .bind(&event.account_id)
        .bind(event.created_at)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = inserted {
            return Ok(EventRecord::Inserted(row.into()));
        }

        let existing: EventRow = sqlx::query_as(&format!(
            "SELECT {EVENT_COLUMNS} FROM stripe_events WHERE id = $1"
        ))
        .bind(&event.id)
        .fetch_one(&self.pool)
        .await?;

        Ok(EventRecord::Existing(existing.into()))
    }

    async fn get_event(&self, event_id: &str) -> BillingResult<Option<InboundEvent>> {
        let row: Option<EventRow> = sqlx::query_as(&format!(
            "SELECT {EVENT_COLUMNS} FROM stripe_events WHERE id = $1"
        ))
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn mark_event_processed(&self, event_id: &str, at: OffsetDateTime) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE stripe_events
            SET processed = TRUE, processing_error = NULL, processed_at = $2, attempts = attempts + 1
            WHERE id = $1
            "#,
        )
        .bind(event_id)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_event_failed(&self, event_id: &str, error: &str) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE stripe_events
            SET processing_error = $2, attempts = attempts + 1
            WHERE id = $1
            "#,
        )
        .bind(event_id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_failed_events(
        &self,
        older_than: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<Vec<InboundEvent>> {
        let rows: Vec<EventRow> = sqlx::query_as(&format!(
            r#"
            SELECT {EVENT_COLUMNS}
            FROM stripe_events
            WHERE processed = FALSE AND created_at < $1
            ORDER BY created_at ASC
            LIMIT $2
            "#
        ))
        .bind(older_than)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn get_business(&self, business_id: Uuid) -> BillingResult<Option<Business>> {
        let row: Option<BusinessRow> = sqlx::query_as(
            r#"
            SELECT id, name, onboarding_status, stripe_account_id, last_processed_event_id, updated_at
            FROM businesses WHERE id = $1
            "#,
        )
        .bind(business_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn get_business_by_account(&self, account_id: &str) -> BillingResult<Option<Business>> {
        let row: Option<BusinessRow> = sqlx::query_as(
            r#"
            SELECT id, name, onboarding_status, stripe_account_id, last_processed_event_id, updated_at
            FROM businesses WHERE stripe_account_id = $1
            "#,
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn update_business_status(
        &self,
        business_id: Uuid,
        status: OnboardingStatus,
        last_event_id: Option<&str>,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE businesses
            SET onboarding_status = $2,
                last_processed_event_id = COALESCE($3, last_processed_event_id),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(business_id)
        .bind(status.as_str())
        .bind(last_event_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn append_transition(&self, transition: &OnboardingTransition) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO onboarding_transitions
                (id, business_id, from_status, to_status, reason, source, source_event_id, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(transition.id)
        .bind(transition.business_id)
        .bind(transition.from_status.as_str())
        .bind(transition.to_status.as_str())
        .bind(&transition.reason)
        .bind(transition.source.as_str())
        .bind(&transition.source_event_id)
        .bind(transition.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_transitions(&self, business_id: Uuid) -> BillingResult<Vec<OnboardingTransition>> {
        let rows: Vec<TransitionRow> = sqlx::query_as(
            r#"
            SELECT id, business_id, from_status, to_status, reason, source, source_event_id, created_at
            FROM onboarding_transitions
            WHERE business_id = $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(business_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn get_plan(&self, plan_id: Uuid) -> BillingResult<Option<Plan>> {
        let row: Option<PlanRow> =
            sqlx::query_as(&format!("SELECT {PLAN_COLUMNS} FROM plans WHERE id = $1"))
                .bind(plan_id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn list_plans_by_mode(&self, mode: PricingMode) -> BillingResult<Vec<Plan>> {
        let rows: Vec<PlanRow> = sqlx::query_as(&format!(
            "SELECT {PLAN_COLUMNS} FROM plans WHERE pricing_mode = $1 ORDER BY id"
        ))
        .bind(mode.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn save_plan(&self, plan: &Plan) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE plans
            SET name = $2,
                pricing_mode = $3,
                base_price_cents = $4,
                stripe_price_id = $5,
                active = $6,
                updated_at = $7
            WHERE id = $1
            "#,
        )
        .bind(plan.id)
        .bind(&plan.name)
        .bind(plan.pricing_mode.as_str())
        .bind(plan.base_price.map(MinorUnits::get))
        .bind(&plan.stripe_price_id)
        .bind(plan.active)
        .bind(plan.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_queue_items(&self, plan_id: Uuid) -> BillingResult<Vec<PriceQueueItem>> {
        let rows: Vec<QueueItemRow> = sqlx::query_as(&format!(
            r#"
            SELECT {QUEUE_COLUMNS}
            FROM price_queue_items
            WHERE plan_id = $1
            ORDER BY effective_month ASC, created_at ASC
            "#
        ))
        .bind(plan_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn delete_pending_queue_items(&self, plan_id: Uuid) -> BillingResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM price_queue_items
            WHERE plan_id = $1 AND applied = FALSE AND retired_at IS NULL
            "#,
        )
        .bind(plan_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn insert_queue_items(&self, items: &[PriceQueueItem]) -> BillingResult<()> {
        let mut tx = self.pool.begin().await?;
        for item in items {
            sqlx::query(
                r#"
                INSERT INTO price_queue_items
                    (id, plan_id, effective_month, price_cents, applied, stripe_price_id, retired_at, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(item.id)
            .bind(item.plan_id)
            .bind(item.effective_month.first_day())
            .bind(item.price.get())
            .bind(item.applied)
            .bind(&item.stripe_price_id)
            .bind(item.retired_at)
            .bind(item.created_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn update_queue_item(&self, item: &PriceQueueItem) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE price_queue_items
            SET price_cents = $2, applied = $3, stripe_price_id = $4, retired_at = $5
            WHERE id = $1
            "#,
        )
        .bind(item.id)
        .bind(item.price.get())
        .bind(item.applied)
        .bind(&item.stripe_price_id)
        .bind(item.retired_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn retire_pending_queue_items(&self, plan_id: Uuid, at: OffsetDateTime) -> BillingResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE price_queue_items
            SET retired_at = $2
            WHERE plan_id = $1 AND applied = FALSE AND retired_at IS NULL
            "#,
        )
        .bind(plan_id)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn get_consumer(&self, consumer_id: Uuid) -> BillingResult<Option<Consumer>> {
        let row: Option<ConsumerRow> = sqlx::query_as(
            "SELECT id, business_id, email, stripe_customer_id, created_at FROM consumers WHERE id = $1",
        )
        .bind(consumer_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn find_consumer_by_email(
        &self,
        business_id: Uuid,
        email: &str,
    ) -> BillingResult<Option<Consumer>> {
        let row: Option<ConsumerRow> = sqlx::query_as(
            r#"
            SELECT id, business_id, email, stripe_customer_id, created_at
            FROM consumers
            WHERE business_id = $1 AND email = $2
            "#,
        )
        .bind(business_id)
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn upsert_consumer(&self, consumer: &Consumer) -> BillingResult<Consumer> {
        let row: ConsumerRow = sqlx::query_as(
            r#"
            INSERT INTO consumers (id, business_id, email, stripe_customer_id, created_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (business_id, email) DO UPDATE
            SET stripe_customer_id = COALESCE(consumers.stripe_customer_id, EXCLUDED.stripe_customer_id)
            RETURNING id, business_id, email, stripe_customer_id, created_at
            "#,
        )
        .bind(consumer.id)
        .bind(consumer.business_id)
        .bind(&consumer.email)
        .bind(&consumer.stripe_customer_id)
        .bind(consumer.created_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }

    async fn find_current_subscription(
        &self,
        stripe_subscription_id: &str,
    ) -> BillingResult<Option<CurrentSubscription>> {
        let row: Option<CurrentSubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE stripe_subscription_id = $1"
        ))
        .bind(stripe_subscription_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn find_legacy_subscription(
        &self,
        stripe_subscription_id: &str,
    ) -> BillingResult<Option<LegacySubscription>> {
        let row: Option<MembershipRow> = sqlx::query_as(&format!(
            "SELECT {MEMBERSHIP_COLUMNS} FROM memberships WHERE stripe_subscription_id = $1"
        ))
        .bind(stripe_subscription_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn insert_current_subscription(&self, subscription: &CurrentSubscription) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO subscriptions (
                id, stripe_subscription_id, business_id, consumer_id, plan_id, status,
                current_period_start, current_period_end, cancel_at_period_end,
                paused_at, last_synced_at, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (stripe_subscription_id) DO NOTHING
            "#,
        )
        .bind(subscription.id)
        .bind(&subscription.stripe_subscription_id)
        .bind(subscription.business_id)
        .bind(subscription.consumer_id)
        .bind(subscription.plan_id)
        .bind(&subscription.status)
        .bind(subscription.current_period_start)
        .bind(subscription.current_period_end)
        .bind(subscription.cancel_at_period_end)
        .bind(subscription.paused_at)
        .bind(subscription.last_synced_at)
        .bind(subscription.created_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn apply_subscription_sync(
        &self,
        key: SubscriptionKey,
        fields: &SubscriptionSyncFields,
    ) -> BillingResult<()> {
        let (sql, id) = match key {
            SubscriptionKey::Current(id) => (
                r#"
                UPDATE subscriptions
                SET status = $2, current_period_start = $3, current_period_end = $4,
                    cancel_at_period_end = $5, last_synced_at = $6
                WHERE id = $1
                "#,
                id,
            ),
            SubscriptionKey::Legacy(id) => (
                r#"
                UPDATE memberships
                SET stripe_status = $2, period_start = $3, period_end = $4,
                    cancel_at_period_end = $5, synced_at = $6
                WHERE id = $1
                "#,
                id,
            ),
        };
        sqlx::query(sql)
            .bind(id)
            .bind(&fields.status)
            .bind(fields.current_period_start)
            .bind(fields.current_period_end)
            .bind(fields.cancel_at_period_end)
            .bind(fields.synced_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_subscription_status(
        &self,
        key: SubscriptionKey,
        status: &str,
        synced_at: OffsetDateTime,
    ) -> BillingResult<()> {
        let (sql, id) = match key {
            SubscriptionKey::Current(id) => (
                "UPDATE subscriptions SET status = $2, last_synced_at = $3 WHERE id = $1",
                id,
            ),
            SubscriptionKey::Legacy(id) => (
                "UPDATE memberships SET stripe_status = $2, synced_at = $3 WHERE id = $1",
                id,
            ),
        };
        sqlx::query(sql)
            .bind(id)
            .bind(status)
            .bind(synced_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_subscription_paused(
        &self,
        key: SubscriptionKey,
        paused_at: Option<OffsetDateTime>,
    ) -> BillingResult<()> {
        let (sql, id) = match key {
            SubscriptionKey::Current(id) => ("UPDATE subscriptions SET paused_at = $2 WHERE id = $1", id),
            SubscriptionKey::Legacy(id) => ("UPDATE memberships SET paused_at = $2 WHERE id = $1", id),
        };
        sqlx::query(sql)
            .bind(id)
            .bind(paused_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_plan_subscriptions(&self, plan_id: Uuid) -> BillingResult<Vec<SubscriptionRecord>> {
        let current: Vec<CurrentSubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE plan_id = $1 ORDER BY stripe_subscription_id"
        ))
        .bind(plan_id)
        .fetch_all(&self.pool)
        .await?;

        let legacy: Vec<MembershipRow> = sqlx::query_as(&format!(
            "SELECT {MEMBERSHIP_COLUMNS} FROM memberships WHERE plan_id = $1 ORDER BY stripe_subscription_id"
        ))
        .bind(plan_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(current
            .into_iter()
            .map(|row| SubscriptionRecord::Current(row.into()))
            .chain(legacy.into_iter().map(|row| SubscriptionRecord::Legacy(row.into())))
            .collect())
    }

    async fn insert_alert(&self, alert: &Alert) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO billing_alerts (
                id, alert_type, severity, business_id, plan_id, stripe_subscription_id,
                title, metadata, resolved, resolved_at, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(alert.id)
        .bind(alert.alert_type.as_str())
        .bind(alert.severity.as_str())
        .bind(alert.business_id)
        .bind(alert.plan_id)
        .bind(&alert.stripe_subscription_id)
        .bind(&alert.title)
        .bind(&alert.metadata)
        .bind(alert.resolved)
        .bind(alert.resolved_at)
        .bind(alert.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn resolve_alerts_for_subscriptions(
        &self,
        stripe_subscription_ids: &[String],
        alert_type: Option<AlertType>,
    ) -> BillingResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE billing_alerts
            SET resolved = TRUE, resolved_at = NOW()
            WHERE resolved = FALSE
              AND stripe_subscription_id = ANY($1)
              AND ($2::TEXT IS NULL OR alert_type = $2)
            "#,
        )
        .bind(stripe_subscription_ids)
        .bind(alert_type.map(|t| t.as_str()))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn resolve_alerts_for_plan(&self, plan_id: Uuid, alert_type: AlertType) -> BillingResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE billing_alerts
            SET resolved = TRUE, resolved_at = NOW()
            WHERE resolved = FALSE AND plan_id = $1 AND alert_type = $2
            "#,
        )
        .bind(plan_id)
        .bind(alert_type.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn find_open_alert(&self, plan_id: Uuid, alert_type: AlertType) -> BillingResult<Option<Alert>> {
        let row: Option<AlertRow> = sqlx::query_as(&format!(
            r#"
            SELECT {ALERT_COLUMNS}
            FROM billing_alerts
            WHERE resolved = FALSE AND plan_id = $1 AND alert_type = $2
            ORDER BY created_at DESC
            LIMIT 1
            "#
        ))
        .bind(plan_id)
        .bind(alert_type.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn list_open_alerts(&self) -> BillingResult<Vec<Alert>> {
        let rows: Vec<AlertRow> = sqlx::query_as(&format!(
            "SELECT {ALERT_COLUMNS} FROM billing_alerts WHERE resolved = FALSE ORDER BY created_at DESC"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn insert_audit_entry(&self, entry: &AuditEntry) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO audit_entries (
                id, business_id, event_type, entity_type, entity_id, event_data,
                actor_type, actor_id, stripe_event_id, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(entry.id)
        .bind(entry.business_id)
        .bind(&entry.event_type)
        .bind(&entry.entity_type)
        .bind(&entry.entity_id)
        .bind(&entry.event_data)
        .bind(&entry.actor_type)
        .bind(entry.actor_id)
        .bind(&entry.stripe_event_id)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> PgBillingStore {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL required");
        let pool = memberpass_shared::db::create_pool(&url, 2)
            .await
            .expect("Failed to create pool");
        memberpass_shared::db::run_migrations(&pool)
            .await
            .expect("Failed to run migrations");
        PgBillingStore::new(pool)
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_record_event_claims_once() {
        let store = store().await;
        let event = InboundEvent {
            id: format!("evt_{}", Uuid::new_v4().simple()),
            event_type: "invoice.paid".to_string(),
            payload: "{}".to_string(),
            signature_valid: true,
            account_id: None,
            processed: false,
            processing_error: None,
            attempts: 0,
            created_at: OffsetDateTime::now_utc(),
            processed_at: None,
        };

        assert!(matches!(
            store.record_event(&event).await.unwrap(),
            EventRecord::Inserted(_)
        ));
        store.mark_event_failed(&event.id, "boom").await.unwrap();

        match store.record_event(&event).await.unwrap() {
            EventRecord::Existing(stored) => {
                assert!(!stored.processed);
                assert_eq!(stored.processing_error.as_deref(), Some("boom"));
            }
            other => panic!("expected existing row, got {:?}", other),
        }
    }
}
