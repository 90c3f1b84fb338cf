//! Persistent billing records
//!
//! These are the rows the engine reads and writes through [`crate::store::BillingStore`].
//! Subscriptions exist in two shapes while the membership migration is in flight:
//! the current `subscriptions` model and the legacy `memberships` model. Code that
//! does not care about the difference works with [`SubscriptionRecord`].

use memberpass_shared::{MinorUnits, Month};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingError;
use crate::onboarding::OnboardingStatus;

/// Subscription statuses that still bill (or will bill once resumed)
pub const BILLABLE_STATUSES: [&str; 3] = ["active", "trialing", "paused"];

/// Terminal status written by the deletion path
pub const CANCELED_STATUS: &str = "canceled";

// =============================================================================
// Inbound events
// =============================================================================

/// A processor event as persisted on receipt
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InboundEvent {
    /// Processor event id (`evt_...`), unique
    pub id: String,
    pub event_type: String,
    /// Raw request body exactly as received
    pub payload: String,
    pub signature_valid: bool,
    /// Connected account the event belongs to
    pub account_id: Option<String>,
    pub processed: bool,
    pub processing_error: Option<String>,
    pub attempts: i32,
    pub created_at: OffsetDateTime,
    pub processed_at: Option<OffsetDateTime>,
}

// =============================================================================
// Businesses
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Business {
    pub id: Uuid,
    pub name: String,
    pub onboarding_status: OnboardingStatus,
    pub stripe_account_id: Option<String>,
    pub last_processed_event_id: Option<String>,
    pub updated_at: OffsetDateTime,
}

/// Who asked for an onboarding status change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionSource {
    Webhook,
    User,
}

impl TransitionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Webhook => "webhook",
            Self::User => "user",
        }
    }
}

impl FromStr for TransitionSource {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "webhook" => Ok(Self::Webhook),
            "user" => Ok(Self::User),
            other => Err(BillingError::Internal(format!(
                "unknown transition source: {}",
                other
            ))),
        }
    }
}

/// One immutable row of a business's onboarding history
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OnboardingTransition {
    pub id: Uuid,
    pub business_id: Uuid,
    pub from_status: OnboardingStatus,
    pub to_status: OnboardingStatus,
    pub reason: String,
    pub source: TransitionSource,
    pub source_event_id: Option<String>,
    pub created_at: OffsetDateTime,
}

// =============================================================================
// Plans and the price queue
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PricingMode {
    Fixed,
    Dynamic,
}

impl PricingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fixed => "fixed",
            Self::Dynamic => "dynamic",
        }
    }
}

impl fmt::Display for PricingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PricingMode {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "fixed" => Ok(Self::Fixed),
            "dynamic" => Ok(Self::Dynamic),
            other => Err(BillingError::InvalidInput(format!(
                "unknown pricing mode: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Plan {
    pub id: Uuid,
    pub business_id: Uuid,
    pub name: String,
    pub pricing_mode: PricingMode,
    /// Only meaningful for FIXED plans
    pub base_price: Option<MinorUnits>,
    pub stripe_product_id: String,
    /// Price new signups and renewals are billed at
    pub stripe_price_id: Option<String>,
    pub active: bool,
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PriceQueueItem {
    pub id: Uuid,
    pub plan_id: Uuid,
    pub effective_month: Month,
    pub price: MinorUnits,
    pub applied: bool,
    /// Set exactly when the item is applied
    pub stripe_price_id: Option<String>,
    /// Archived items are kept as history and never resolve
    pub retired_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
}

impl PriceQueueItem {
    pub fn pending(plan_id: Uuid, effective_month: Month, price: MinorUnits) -> Self {
        Self {
            id: Uuid::new_v4(),
            plan_id,
            effective_month,
            price,
            applied: false,
            stripe_price_id: None,
            retired_at: None,
            created_at: OffsetDateTime::now_utc(),
        }
    }

    /// Applied and not archived
    pub fn is_live(&self) -> bool {
        self.applied && self.retired_at.is_none()
    }

    /// Neither applied nor archived; replaced wholesale on schedule edits
    pub fn is_pending(&self) -> bool {
        !self.applied && self.retired_at.is_none()
    }
}

/// One entry of an operator-submitted monthly schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonthlyPrice {
    pub month: Month,
    pub price_cents: MinorUnits,
}

// =============================================================================
// Consumers and subscriptions
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Consumer {
    pub id: Uuid,
    pub business_id: Uuid,
    pub email: String,
    pub stripe_customer_id: Option<String>,
    pub created_at: OffsetDateTime,
}

/// Row of the current `subscriptions` model
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CurrentSubscription {
    pub id: Uuid,
    pub stripe_subscription_id: String,
    pub business_id: Uuid,
    pub consumer_id: Uuid,
    pub plan_id: Uuid,
    pub status: String,
    pub current_period_start: OffsetDateTime,
    pub current_period_end: OffsetDateTime,
    pub cancel_at_period_end: bool,
    pub paused_at: Option<OffsetDateTime>,
    pub last_synced_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
}

/// Row of the legacy `memberships` model, which stored the member's email
/// inline instead of referencing a consumer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LegacySubscription {
    pub id: Uuid,
    pub stripe_subscription_id: String,
    pub business_id: Uuid,
    pub member_email: String,
    pub plan_id: Uuid,
    pub stripe_status: String,
    pub period_start: OffsetDateTime,
    pub period_end: OffsetDateTime,
    pub cancel_at_period_end: bool,
    pub paused_at: Option<OffsetDateTime>,
    pub synced_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
}

/// Storage key of a subscription in whichever model holds it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionKey {
    Current(Uuid),
    Legacy(Uuid),
}

/// A subscription in either representation
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionRecord {
    Current(CurrentSubscription),
    Legacy(LegacySubscription),
}

impl SubscriptionRecord {
    pub fn key(&self) -> SubscriptionKey {
        match self {
            Self::Current(s) => SubscriptionKey::Current(s.id),
            Self::Legacy(s) => SubscriptionKey::Legacy(s.id),
        }
    }

    pub fn stripe_subscription_id(&self) -> &str {
        match self {
            Self::Current(s) => &s.stripe_subscription_id,
            Self::Legacy(s) => &s.stripe_subscription_id,
        }
    }

    pub fn plan_id(&self) -> Uuid {
        match self {
            Self::Current(s) => s.plan_id,
            Self::Legacy(s) => s.plan_id,
        }
    }

    pub fn business_id(&self) -> Uuid {
        match self {
            Self::Current(s) => s.business_id,
            Self::Legacy(s) => s.business_id,
        }
    }

    pub fn status(&self) -> &str {
        match self {
            Self::Current(s) => &s.status,
            Self::Legacy(s) => &s.stripe_status,
        }
    }

    pub fn current_period_start(&self) -> OffsetDateTime {
        match self {
            Self::Current(s) => s.current_period_start,
            Self::Legacy(s) => s.period_start,
        }
    }

    pub fn current_period_end(&self) -> OffsetDateTime {
        match self {
            Self::Current(s) => s.current_period_end,
            Self::Legacy(s) => s.period_end,
        }
    }

    pub fn paused_at(&self) -> Option<OffsetDateTime> {
        match self {
            Self::Current(s) => s.paused_at,
            Self::Legacy(s) => s.paused_at,
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused_at().is_some()
    }

    pub fn is_billable(&self) -> bool {
        BILLABLE_STATUSES.contains(&self.status())
    }

    pub fn model(&self) -> &'static str {
        match self {
            Self::Current(_) => "current",
            Self::Legacy(_) => "legacy",
        }
    }
}

/// The only fields a processor sync is allowed to write
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionSyncFields {
    /// Mirrored verbatim from the processor
    pub status: String,
    pub current_period_start: OffsetDateTime,
    pub current_period_end: OffsetDateTime,
    pub cancel_at_period_end: bool,
    pub synced_at: OffsetDateTime,
}
