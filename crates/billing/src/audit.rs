//! Billing audit log
//!
//! Append-only records of significant state changes. Entries answer questions
//! like "why is this subscription on that price?" and "when did this business
//! finish onboarding?".
//!
//! ## Event Types
//!
//! - Onboarding: completed, restricted
//! - Pricing: price changed, schedule replaced, mode migrated
//! - Remediation: auto-pause, resume runs, renewal price conversion
//! - Subscription lifecycle: canceled

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::store::BillingStore;

/// Types of audit events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditEventType {
    // Onboarding
    OnboardingCompleted,
    OnboardingRestricted,
    OnboardingTransitionRequested,

    // Pricing
    PlanUpdated,
    PriceChanged,
    ScheduleReplaced,
    MigratedToDynamic,
    MigratedToFixed,
    PriceApplied,

    // Remediation
    SubscriptionAutoPaused,
    ResumeCompleted,
    RenewalPriceConverted,
    RenewalPriceConversionFailed,

    // Subscription lifecycle
    SubscriptionCreated,
    SubscriptionCanceled,
}

impl std::fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AuditEventType::OnboardingCompleted => "ONBOARDING_COMPLETED",
            AuditEventType::OnboardingRestricted => "ONBOARDING_RESTRICTED",
            AuditEventType::OnboardingTransitionRequested => "ONBOARDING_TRANSITION_REQUESTED",
            AuditEventType::PlanUpdated => "PLAN_UPDATED",
            AuditEventType::PriceChanged => "PRICE_CHANGED",
            AuditEventType::ScheduleReplaced => "SCHEDULE_REPLACED",
            AuditEventType::MigratedToDynamic => "MIGRATED_TO_DYNAMIC",
            AuditEventType::MigratedToFixed => "MIGRATED_TO_FIXED",
            AuditEventType::PriceApplied => "PRICE_APPLIED",
            AuditEventType::SubscriptionAutoPaused => "SUBSCRIPTION_AUTO_PAUSED",
            AuditEventType::ResumeCompleted => "RESUME_COMPLETED",
            AuditEventType::RenewalPriceConverted => "RENEWAL_PRICE_CONVERTED",
            AuditEventType::RenewalPriceConversionFailed => "RENEWAL_PRICE_CONVERSION_FAILED",
            AuditEventType::SubscriptionCreated => "SUBSCRIPTION_CREATED",
            AuditEventType::SubscriptionCanceled => "SUBSCRIPTION_CANCELED",
        };
        write!(f, "{}", s)
    }
}

/// Who triggered the change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActorType {
    /// Business owner or staff
    User,
    /// Back-office operator
    Operator,
    /// Scheduled jobs and internal automation
    System,
    /// Stripe webhook
    Stripe,
}

impl std::fmt::Display for ActorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActorType::User => write!(f, "user"),
            ActorType::Operator => write!(f, "operator"),
            ActorType::System => write!(f, "system"),
            ActorType::Stripe => write!(f, "stripe"),
        }
    }
}

/// An immutable audit record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEntry {
    pub id: Uuid,
    pub business_id: Option<Uuid>,
    pub event_type: String,
    pub entity_type: String,
    pub entity_id: String,
    pub event_data: serde_json::Value,
    pub actor_type: String,
    pub actor_id: Option<Uuid>,
    pub stripe_event_id: Option<String>,
    pub created_at: OffsetDateTime,
}

/// Builder for audit entries
pub struct AuditEntryBuilder {
    event_type: AuditEventType,
    entity_type: String,
    entity_id: String,
    business_id: Option<Uuid>,
    event_data: serde_json::Value,
    actor_id: Option<Uuid>,
    actor_type: ActorType,
    stripe_event_id: Option<String>,
}

impl AuditEntryBuilder {
    /// Create a new entry builder for the given entity
    pub fn new(
        event_type: AuditEventType,
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
    ) -> Self {
        Self {
            event_type,
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            business_id: None,
            event_data: serde_json::json!({}),
            actor_id: None,
            actor_type: ActorType::System,
            stripe_event_id: None,
        }
    }

    /// Set the owning business
    pub fn business(mut self, business_id: Uuid) -> Self {
        self.business_id = Some(business_id);
        self
    }

    /// Set the event data
    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.event_data = data;
        self
    }

    /// Set the Stripe event ID
    pub fn stripe_event(mut self, event_id: impl Into<String>) -> Self {
        self.stripe_event_id = Some(event_id.into());
        self
    }

    /// Set the actor (user who triggered the event)
    pub fn actor(mut self, actor_id: Uuid, actor_type: ActorType) -> Self {
        self.actor_id = Some(actor_id);
        self.actor_type = actor_type;
        self
    }

    /// Set the actor type without a specific user
    pub fn actor_type(mut self, actor_type: ActorType) -> Self {
        self.actor_type = actor_type;
        self
    }

    pub fn build(self) -> AuditEntry {
        AuditEntry {
            id: Uuid::new_v4(),
            business_id: self.business_id,
            event_type: self.event_type.to_string(),
            entity_type: self.entity_type,
            entity_id: self.entity_id,
            event_data: self.event_data,
            actor_type: self.actor_type.to_string(),
            actor_id: self.actor_id,
            stripe_event_id: self.stripe_event_id,
            created_at: OffsetDateTime::now_utc(),
        }
    }
}

/// Writes audit entries
#[derive(Clone)]
pub struct AuditLogger {
    store: Arc<dyn BillingStore>,
}

impl AuditLogger {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self { store }
    }

    pub async fn log(&self, entry: AuditEntry) -> BillingResult<Uuid> {
        let id = entry.id;
        self.store.insert_audit_entry(&entry).await?;
        Ok(id)
    }

    /// Log an entry; failures are reported but never propagated
    pub async fn log_best_effort(&self, entry: AuditEntry) {
        let event_type = entry.event_type.clone();
        let entity_id = entry.entity_id.clone();
        if let Err(e) = self.log(entry).await {
            tracing::warn!(
                error = %e,
                event_type = %event_type,
                entity_id = %entity_id,
                "Failed to write audit entry"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::InMemoryBillingStore;

    #[test]
    fn test_event_type_display() {
        assert_eq!(
            AuditEventType::OnboardingCompleted.to_string(),
            "ONBOARDING_COMPLETED"
        );
        assert_eq!(AuditEventType::MigratedToFixed.to_string(), "MIGRATED_TO_FIXED");
        assert_eq!(
            AuditEventType::RenewalPriceConversionFailed.to_string(),
            "RENEWAL_PRICE_CONVERSION_FAILED"
        );
    }

    #[test]
    fn test_actor_type_display() {
        assert_eq!(ActorType::User.to_string(), "user");
        assert_eq!(ActorType::Operator.to_string(), "operator");
        assert_eq!(ActorType::System.to_string(), "system");
        assert_eq!(ActorType::Stripe.to_string(), "stripe");
    }

    #[test]
    fn test_builder() {
        let business_id = Uuid::new_v4();
        let entry = AuditEntryBuilder::new(AuditEventType::PriceChanged, "plan", "plan_1")
            .business(business_id)
            .data(serde_json::json!({"price_cents": 4500}))
            .stripe_event("evt_123")
            .actor_type(ActorType::Operator)
            .build();

        assert_eq!(entry.event_type, "PRICE_CHANGED");
        assert_eq!(entry.entity_type, "plan");
        assert_eq!(entry.business_id, Some(business_id));
        assert_eq!(entry.actor_type, "operator");
        assert_eq!(entry.stripe_event_id, Some("evt_123".to_string()));
        assert_eq!(entry.event_data["price_cents"], 4500);
    }

    #[tokio::test]
    async fn test_logger_persists_entry() {
        let store = Arc::new(InMemoryBillingStore::new());
        let logger = AuditLogger::new(store.clone());
        let entry =
            AuditEntryBuilder::new(AuditEventType::SubscriptionCanceled, "subscription", "sub_1")
                .actor_type(ActorType::Stripe)
                .build();

        logger.log(entry.clone()).await.unwrap();

        let entries = store.audit_entries().await;
        assert_eq!(entries, vec![entry]);
    }
}
