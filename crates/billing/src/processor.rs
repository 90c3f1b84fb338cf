//! Payment processor boundary
//!
//! The engine talks to the processor only through [`PaymentProcessor`]. A
//! [`ProcessorFactory`] hands out a client scoped to one connected account so
//! calls made on behalf of a business land on that business's account.

use async_trait::async_trait;
use memberpass_shared::MinorUnits;
use serde::{Deserialize, Deserializer};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::store::BillingStore;

/// Request to mint a recurring monthly price
#[derive(Debug, Clone, PartialEq)]
pub struct NewPrice {
    pub product_id: String,
    pub unit_amount: MinorUnits,
    pub nickname: Option<String>,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalPrice {
    pub id: String,
    pub unit_amount: MinorUnits,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalSubscriptionItem {
    pub id: String,
    pub price_id: String,
}

/// A subscription as the processor reports it.
///
/// Deserializes from the processor's subscription object, which is also the
/// `data.object` of subscription webhook events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalSubscription {
    pub id: String,
    pub customer_id: String,
    pub status: String,
    /// Epoch seconds
    pub current_period_start: i64,
    /// Epoch seconds
    pub current_period_end: i64,
    pub cancel_at_period_end: bool,
    /// Collection is paused at the processor
    pub paused: bool,
    pub items: Vec<ExternalSubscriptionItem>,
    pub metadata: HashMap<String, String>,
}

impl ExternalSubscription {
    pub fn first_item(&self) -> Option<&ExternalSubscriptionItem> {
        self.items.first()
    }
}

#[derive(Deserialize)]
struct WirePrice {
    id: String,
}

#[derive(Deserialize)]
struct WireItem {
    id: String,
    price: WirePrice,
}

#[derive(Deserialize)]
struct WireItems {
    #[serde(default)]
    data: Vec<WireItem>,
}

#[derive(Deserialize)]
struct WireSubscription {
    id: String,
    customer: WireCustomer,
    status: String,
    current_period_start: i64,
    current_period_end: i64,
    #[serde(default)]
    cancel_at_period_end: bool,
    #[serde(default)]
    pause_collection: Option<serde_json::Value>,
    #[serde(default)]
    items: Option<WireItems>,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

/// `customer` is either an id or an expanded object
#[derive(Deserialize)]
#[serde(untagged)]
enum WireCustomer {
    Id(String),
    Object { id: String },
}

impl<'de> Deserialize<'de> for ExternalSubscription {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let wire = WireSubscription::deserialize(deserializer)?;
        Ok(Self {
            id: wire.id,
            customer_id: match wire.customer {
                WireCustomer::Id(id) | WireCustomer::Object { id } => id,
            },
            status: wire.status,
            current_period_start: wire.current_period_start,
            current_period_end: wire.current_period_end,
            cancel_at_period_end: wire.cancel_at_period_end,
            paused: wire.pause_collection.is_some_and(|p| !p.is_null()),
            items: wire
                .items
                .map(|items| {
                    items
                        .data
                        .into_iter()
                        .map(|item| ExternalSubscriptionItem {
                            id: item.id,
                            price_id: item.price.id,
                        })
                        .collect()
                })
                .unwrap_or_default(),
            metadata: wire.metadata,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalInvoice {
    pub id: String,
    pub status: Option<String>,
    pub amount_due: i64,
}

/// Operations the engine needs from the payment processor
#[async_trait]
pub trait PaymentProcessor: Send + Sync {
    async fn create_price(&self, price: NewPrice) -> BillingResult<ExternalPrice>;

    async fn deactivate_price(&self, price_id: &str) -> BillingResult<()>;

    async fn retrieve_subscription(&self, subscription_id: &str) -> BillingResult<ExternalSubscription>;

    /// Move the subscription's line item to `price_id` without proration
    async fn swap_subscription_price(
        &self,
        subscription_id: &str,
        price_id: &str,
    ) -> BillingResult<ExternalSubscription>;

    /// Stop collecting payment; outstanding invoices are voided
    async fn pause_collection(&self, subscription_id: &str) -> BillingResult<()>;

    async fn resume_collection(&self, subscription_id: &str) -> BillingResult<()>;

    /// Create a draft invoice collecting the subscription's pending amount
    async fn create_invoice(
        &self,
        customer_id: &str,
        subscription_id: &str,
    ) -> BillingResult<ExternalInvoice>;

    async fn finalize_invoice(&self, invoice_id: &str) -> BillingResult<ExternalInvoice>;
}

/// Hands out processor clients scoped to a connected account
pub trait ProcessorFactory: Send + Sync {
    /// `None` addresses the platform account
    fn for_account(&self, account_id: Option<&str>) -> Arc<dyn PaymentProcessor>;
}

/// Processor scoped to the connected account of `business_id`
pub async fn processor_for_business(
    store: &dyn BillingStore,
    factory: &dyn ProcessorFactory,
    business_id: Uuid,
) -> BillingResult<Arc<dyn PaymentProcessor>> {
    let business = store
        .get_business(business_id)
        .await?
        .ok_or_else(|| BillingError::NotFound(format!("business {}", business_id)))?;
    Ok(factory.for_account(business.stripe_account_id.as_deref()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscription_from_processor_object() {
        let json = serde_json::json!({
            "id": "sub_123",
            "object": "subscription",
            "customer": "cus_9",
            "status": "active",
            "current_period_start": 1782864000,
            "current_period_end": 1785542400,
            "cancel_at_period_end": false,
            "pause_collection": null,
            "items": {
                "object": "list",
                "data": [{ "id": "si_1", "price": { "id": "price_a", "unit_amount": 4500 } }]
            },
            "metadata": { "plan_id": "abc" }
        });

        let sub: ExternalSubscription = serde_json::from_value(json).unwrap();
        assert_eq!(sub.customer_id, "cus_9");
        assert!(!sub.paused);
        assert_eq!(sub.first_item().unwrap().price_id, "price_a");
        assert_eq!(sub.metadata.get("plan_id").unwrap(), "abc");
    }

    #[test]
    fn test_paused_and_expanded_customer() {
        let json = serde_json::json!({
            "id": "sub_123",
            "customer": { "id": "cus_9", "email": "a@example.com" },
            "status": "active",
            "current_period_start": 1,
            "current_period_end": 2,
            "pause_collection": { "behavior": "void", "resumes_at": null }
        });

        let sub: ExternalSubscription = serde_json::from_value(json).unwrap();
        assert_eq!(sub.customer_id, "cus_9");
        assert!(sub.paused);
        assert!(sub.items.is_empty());
    }
}
