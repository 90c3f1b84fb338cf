//! Live payment processor backed by Stripe

use async_trait::async_trait;
use memberpass_shared::MinorUnits;
use stripe::{
    CollectionMethod, CreateInvoice, CreatePrice, CreatePriceRecurring,
    CreatePriceRecurringInterval, Currency, CustomerId, IdOrCreate, InvoiceId, Price, PriceId,
    Subscription, SubscriptionId, UpdatePrice, UpdateSubscription, UpdateSubscriptionItems,
};
// The crate root also exports the subscription_item enum of the same name
use stripe::generated::billing::subscription::SubscriptionProrationBehavior;

use crate::error::{BillingError, BillingResult};
use crate::processor::{
    ExternalInvoice, ExternalPrice, ExternalSubscription, ExternalSubscriptionItem, NewPrice,
    PaymentProcessor,
};

/// Replace the first item's price without proration
fn price_swap_params(item_id: String, price_id: &str) -> UpdateSubscription<'static> {
    UpdateSubscription {
        items: Some(vec![UpdateSubscriptionItems {
            id: Some(item_id),
            price: Some(price_id.to_string()),
            ..Default::default()
        }]),
        proration_behavior: Some(SubscriptionProrationBehavior::None),
        ..Default::default()
    }
}

/// Stripe-backed processor scoped to one account
pub struct StripeProcessor {
    client: stripe::Client,
    http: reqwest::Client,
    secret_key: String,
    api_base: String,
    account_id: Option<String>,
}

impl StripeProcessor {
    pub fn new(
        client: stripe::Client,
        http: reqwest::Client,
        secret_key: String,
        api_base: String,
        account_id: Option<String>,
    ) -> Self {
        Self {
            client,
            http,
            secret_key,
            api_base,
            account_id,
        }
    }

    /// async-stripe has no way to clear `pause_collection`, so both directions
    /// go through the form-encoded REST endpoint
    async fn post_pause_collection(
        &self,
        subscription_id: &str,
        form: &[(&str, &str)],
    ) -> BillingResult<()> {
        let url = format!("{}/v1/subscriptions/{}", self.api_base, subscription_id);
        let mut request = self.http.post(&url).bearer_auth(&self.secret_key).form(form);
        if let Some(account) = &self.account_id {
            request = request.header("Stripe-Account", account);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(BillingError::StripeApi(format!(
                "pause_collection update for {} failed ({}): {}",
                subscription_id, status, body
            )));
        }
        Ok(())
    }
}

fn parse_subscription_id(id: &str) -> BillingResult<SubscriptionId> {
    id.parse()
        .map_err(|e| BillingError::InvalidInput(format!("Invalid subscription ID {}: {}", id, e)))
}

fn parse_price_id(id: &str) -> BillingResult<PriceId> {
    id.parse()
        .map_err(|e| BillingError::InvalidInput(format!("Invalid price ID {}: {}", id, e)))
}

fn map_price(price: Price) -> BillingResult<ExternalPrice> {
    Ok(ExternalPrice {
        id: price.id.to_string(),
        unit_amount: MinorUnits::new(price.unit_amount.unwrap_or(0))?,
        active: price.active.unwrap_or(false),
    })
}

/// Map a Stripe subscription onto the processor-neutral shape
fn map_subscription(sub: Subscription) -> ExternalSubscription {
    let status = match sub.status {
        stripe::SubscriptionStatus::Active => "active",
        stripe::SubscriptionStatus::Canceled => "canceled",
        stripe::SubscriptionStatus::Incomplete => "incomplete",
        stripe::SubscriptionStatus::IncompleteExpired => "incomplete_expired",
        stripe::SubscriptionStatus::PastDue => "past_due",
        stripe::SubscriptionStatus::Trialing => "trialing",
        stripe::SubscriptionStatus::Unpaid => "unpaid",
        stripe::SubscriptionStatus::Paused => "paused",
    };

    ExternalSubscription {
        id: sub.id.to_string(),
        customer_id: sub.customer.id().to_string(),
        status: status.to_string(),
        current_period_start: sub.current_period_start,
        current_period_end: sub.current_period_end,
        cancel_at_period_end: sub.cancel_at_period_end,
        paused: sub.pause_collection.is_some(),
        items: sub
            .items
            .data
            .into_iter()
            .filter_map(|item| {
                item.price.map(|price| ExternalSubscriptionItem {
                    id: item.id.to_string(),
                    price_id: price.id.to_string(),
                })
            })
            .collect(),
        metadata: sub.metadata.into_iter().collect(),
    }
}

fn map_invoice(invoice: stripe::Invoice) -> ExternalInvoice {
    ExternalInvoice {
        id: invoice.id.to_string(),
        status: invoice.status.map(|s| s.as_str().to_string()),
        amount_due: invoice.amount_due.unwrap_or(0),
    }
}

#[async_trait]
impl PaymentProcessor for StripeProcessor {
    async fn create_price(&self, price: NewPrice) -> BillingResult<ExternalPrice> {
        let mut params = CreatePrice::new(Currency::USD);
        params.product = Some(IdOrCreate::Id(&price.product_id));
        params.unit_amount = Some(price.unit_amount.get());
        params.nickname = price.nickname.as_deref();
        params.recurring = Some(CreatePriceRecurring {
            interval: CreatePriceRecurringInterval::Month,
            interval_count: None,
            aggregate_usage: None,
            trial_period_days: None,
            usage_type: None,
        });
        params.metadata = Some(price.metadata.clone());

        let created = Price::create(&self.client, params).await?;

        tracing::info!(
            price_id = %created.id,
            product_id = %price.product_id,
            amount_cents = price.unit_amount.get(),
            account_id = ?self.account_id,
            "Created Stripe price"
        );

        map_price(created)
    }

    async fn deactivate_price(&self, price_id: &str) -> BillingResult<()> {
        let id = parse_price_id(price_id)?;
        let params = UpdatePrice {
            active: Some(false),
            ..Default::default()
        };
        Price::update(&self.client, &id, params).await?;
        tracing::info!(price_id = %price_id, "Deactivated Stripe price");
        Ok(())
    }

    async fn retrieve_subscription(&self, subscription_id: &str) -> BillingResult<ExternalSubscription> {
        let id = parse_subscription_id(subscription_id)?;
        let subscription = Subscription::retrieve(&self.client, &id, &[]).await?;
        Ok(map_subscription(subscription))
    }

    async fn swap_subscription_price(
        &self,
        subscription_id: &str,
        price_id: &str,
    ) -> BillingResult<ExternalSubscription> {
        let id = parse_subscription_id(subscription_id)?;

        // Get current subscription to get the item ID
        let current = Subscription::retrieve(&self.client, &id, &[]).await?;
        let item_id = current
            .items
            .data
            .first()
            .map(|item| item.id.to_string())
            .ok_or_else(|| BillingError::Internal("No subscription items found".to_string()))?;

        let updated = Subscription::update(&self.client, &id, price_swap_params(item_id, price_id)).await?;

        tracing::info!(
            subscription_id = %subscription_id,
            price_id = %price_id,
            "Swapped subscription price without proration"
        );

        Ok(map_subscription(updated))
    }

    async fn pause_collection(&self, subscription_id: &str) -> BillingResult<()> {
        self.post_pause_collection(subscription_id, &[("pause_collection[behavior]", "void")])
            .await?;
        tracing::info!(subscription_id = %subscription_id, "Paused subscription collection");
        Ok(())
    }

    async fn resume_collection(&self, subscription_id: &str) -> BillingResult<()> {
        self.post_pause_collection(subscription_id, &[("pause_collection", "")])
            .await?;
        tracing::info!(subscription_id = %subscription_id, "Resumed subscription collection");
        Ok(())
    }

    async fn create_invoice(
        &self,
        customer_id: &str,
        subscription_id: &str,
    ) -> BillingResult<ExternalInvoice> {
        let customer = customer_id
            .parse::<CustomerId>()
            .map_err(|e| BillingError::InvalidInput(format!("Invalid customer ID: {}", e)))?;
        let subscription = parse_subscription_id(subscription_id)?;

        let mut params = CreateInvoice::new();
        params.customer = Some(customer);
        params.subscription = Some(subscription);
        params.auto_advance = Some(true);
        params.collection_method = Some(CollectionMethod::ChargeAutomatically);

        let invoice = stripe::Invoice::create(&self.client, params).await?;

        tracing::info!(
            invoice_id = %invoice.id,
            customer_id = %customer_id,
            subscription_id = %subscription_id,
            "Created invoice"
        );

        Ok(map_invoice(invoice))
    }

    async fn finalize_invoice(&self, invoice_id: &str) -> BillingResult<ExternalInvoice> {
        let id = invoice_id
            .parse::<InvoiceId>()
            .map_err(|e| BillingError::InvalidInput(format!("Invalid invoice ID: {}", e)))?;
        let finalized = stripe::Invoice::finalize(&self.client, &id, Default::default()).await?;

        tracing::info!(
            invoice_id = %invoice_id,
            status = ?finalized.status,
            "Finalized invoice"
        );

        Ok(map_invoice(finalized))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_price_swap_disables_proration() {
        let params = price_swap_params("si_1".to_string(), "price_new");

        assert_eq!(params.proration_behavior, Some(SubscriptionProrationBehavior::None));
        let items = params.items.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id.as_deref(), Some("si_1"));
        assert_eq!(items[0].price.as_deref(), Some("price_new"));
    }
}
