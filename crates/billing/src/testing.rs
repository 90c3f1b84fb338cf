//! Scripted collaborators for tests and local development
//!
//! [`InMemoryProcessor`] keeps prices, subscriptions and invoices in memory,
//! records every call, and can be told to fail or stall specific operations.
//! [`RecordingNotifier`] captures notifications instead of sending them.

use async_trait::async_trait;
use memberpass_shared::MinorUnits;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use time::Date;

use crate::error::{BillingError, BillingResult};
use crate::notifications::Notifier;
use crate::processor::{
    ExternalInvoice, ExternalPrice, ExternalSubscription, ExternalSubscriptionItem, NewPrice,
    PaymentProcessor, ProcessorFactory,
};

/// Processor operations that can be scripted to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessorOp {
    CreatePrice,
    DeactivatePrice,
    RetrieveSubscription,
    SwapPrice,
    PauseCollection,
    ResumeCollection,
    CreateInvoice,
    FinalizeInvoice,
}

/// One recorded processor call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessorCall {
    pub op: ProcessorOp,
    /// Subscription, price or invoice the call addressed
    pub target: String,
    pub account_id: Option<String>,
}

#[derive(Default)]
struct ProcessorState {
    prices: HashMap<String, ExternalPrice>,
    subscriptions: HashMap<String, ExternalSubscription>,
    invoices: HashMap<String, ExternalInvoice>,
    calls: Vec<ProcessorCall>,
    /// (op, target) pairs that fail; a `None` target fails every call of the op
    failures: HashSet<(ProcessorOp, Option<String>)>,
    delays: HashMap<String, Duration>,
    op_delays: HashMap<ProcessorOp, Duration>,
    next_id: u64,
}

impl ProcessorState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}_{:06}", prefix, self.next_id)
    }
}

/// In-memory processor shared by every account-scoped handle
#[derive(Clone, Default)]
pub struct InMemoryProcessor {
    state: Arc<Mutex<ProcessorState>>,
    account_id: Option<String>,
}

impl InMemoryProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ProcessorState> {
        // A poisoned lock only means another test thread panicked mid-call
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn scoped(&self, account_id: Option<&str>) -> Self {
        Self {
            state: Arc::clone(&self.state),
            account_id: account_id.map(str::to_string),
        }
    }

    fn record(&self, op: ProcessorOp, target: &str) -> BillingResult<()> {
        let mut state = self.lock();
        state.calls.push(ProcessorCall {
            op,
            target: target.to_string(),
            account_id: self.account_id.clone(),
        });
        if state.failures.contains(&(op, Some(target.to_string())))
            || state.failures.contains(&(op, None))
        {
            return Err(BillingError::StripeApi(format!(
                "scripted failure: {:?} on {}",
                op, target
            )));
        }
        Ok(())
    }

    /// Add or replace a subscription the processor knows about
    pub fn insert_subscription(&self, subscription: ExternalSubscription) {
        self.lock()
            .subscriptions
            .insert(subscription.id.clone(), subscription);
    }

    /// Convenience constructor for a single-item subscription
    pub fn add_subscription(
        &self,
        id: &str,
        customer_id: &str,
        price_id: &str,
        status: &str,
        paused: bool,
    ) -> ExternalSubscription {
        let now = time::OffsetDateTime::now_utc().unix_timestamp();
        let subscription = ExternalSubscription {
            id: id.to_string(),
            customer_id: customer_id.to_string(),
            status: status.to_string(),
            current_period_start: now,
            current_period_end: now + 30 * 24 * 60 * 60,
            cancel_at_period_end: false,
            paused,
            items: vec![ExternalSubscriptionItem {
                id: format!("si_{}", id),
                price_id: price_id.to_string(),
            }],
            metadata: HashMap::new(),
        };
        self.insert_subscription(subscription.clone());
        subscription
    }

    pub fn subscription(&self, id: &str) -> Option<ExternalSubscription> {
        self.lock().subscriptions.get(id).cloned()
    }

    pub fn price(&self, id: &str) -> Option<ExternalPrice> {
        self.lock().prices.get(id).cloned()
    }

    pub fn invoices(&self) -> Vec<ExternalInvoice> {
        let mut invoices: Vec<_> = self.lock().invoices.values().cloned().collect();
        invoices.sort_by(|a, b| a.id.cmp(&b.id));
        invoices
    }

    pub fn calls(&self) -> Vec<ProcessorCall> {
        self.lock().calls.clone()
    }

    pub fn calls_for(&self, op: ProcessorOp) -> Vec<ProcessorCall> {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.op == op)
            .cloned()
            .collect()
    }

    /// Make `op` fail for `target`, or for every target when `None`
    pub fn fail(&self, op: ProcessorOp, target: Option<&str>) {
        self.lock()
            .failures
            .insert((op, target.map(str::to_string)));
    }

    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    /// Stall every call that addresses `subscription_id`
    pub fn delay(&self, subscription_id: &str, delay: Duration) {
        self.lock()
            .delays
            .insert(subscription_id.to_string(), delay);
    }

    /// Stall every call of `op`, whatever it addresses
    pub fn stall(&self, op: ProcessorOp, delay: Duration) {
        self.lock().op_delays.insert(op, delay);
    }

    async fn maybe_stall(&self, op: ProcessorOp, target: &str) {
        let delay = {
            let state = self.lock();
            state
                .delays
                .get(target)
                .or_else(|| state.op_delays.get(&op))
                .copied()
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn with_subscription<T>(
        &self,
        id: &str,
        f: impl FnOnce(&mut ExternalSubscription) -> T,
    ) -> BillingResult<T> {
        let mut state = self.lock();
        let subscription = state
            .subscriptions
            .get_mut(id)
            .ok_or_else(|| BillingError::StripeApi(format!("No such subscription: {}", id)))?;
        Ok(f(subscription))
    }
}

#[async_trait]
impl PaymentProcessor for InMemoryProcessor {
    async fn create_price(&self, price: NewPrice) -> BillingResult<ExternalPrice> {
        self.maybe_stall(ProcessorOp::CreatePrice, &price.product_id).await;
        self.record(ProcessorOp::CreatePrice, &price.product_id)?;
        let mut state = self.lock();
        let id = state.next_id("price");
        let created = ExternalPrice {
            id: id.clone(),
            unit_amount: price.unit_amount,
            active: true,
        };
        state.prices.insert(id, created.clone());
        Ok(created)
    }

    async fn deactivate_price(&self, price_id: &str) -> BillingResult<()> {
        self.maybe_stall(ProcessorOp::DeactivatePrice, price_id).await;
        self.record(ProcessorOp::DeactivatePrice, price_id)?;
        let mut state = self.lock();
        let price = state
            .prices
            .entry(price_id.to_string())
            .or_insert_with(|| ExternalPrice {
                id: price_id.to_string(),
                unit_amount: MinorUnits::ZERO,
                active: true,
            });
        price.active = false;
        Ok(())
    }

    async fn retrieve_subscription(&self, subscription_id: &str) -> BillingResult<ExternalSubscription> {
        self.maybe_stall(ProcessorOp::RetrieveSubscription, subscription_id).await;
        self.record(ProcessorOp::RetrieveSubscription, subscription_id)?;
        self.with_subscription(subscription_id, |s| s.clone())
    }

    async fn swap_subscription_price(
        &self,
        subscription_id: &str,
        price_id: &str,
    ) -> BillingResult<ExternalSubscription> {
        self.maybe_stall(ProcessorOp::SwapPrice, subscription_id).await;
        self.record(ProcessorOp::SwapPrice, subscription_id)?;
        self.with_subscription(subscription_id, |s| {
            match s.items.first_mut() {
                Some(item) => item.price_id = price_id.to_string(),
                None => s.items.push(ExternalSubscriptionItem {
                    id: format!("si_{}", subscription_id),
                    price_id: price_id.to_string(),
                }),
            }
            s.clone()
        })
    }

    async fn pause_collection(&self, subscription_id: &str) -> BillingResult<()> {
        self.maybe_stall(ProcessorOp::PauseCollection, subscription_id).await;
        self.record(ProcessorOp::PauseCollection, subscription_id)?;
        self.with_subscription(subscription_id, |s| s.paused = true)
    }

    async fn resume_collection(&self, subscription_id: &str) -> BillingResult<()> {
        self.maybe_stall(ProcessorOp::ResumeCollection, subscription_id).await;
        self.record(ProcessorOp::ResumeCollection, subscription_id)?;
        self.with_subscription(subscription_id, |s| s.paused = false)
    }

    async fn create_invoice(
        &self,
        customer_id: &str,
        subscription_id: &str,
    ) -> BillingResult<ExternalInvoice> {
        self.maybe_stall(ProcessorOp::CreateInvoice, subscription_id).await;
        self.record(ProcessorOp::CreateInvoice, subscription_id)?;
        let mut state = self.lock();
        let amount_due = state
            .subscriptions
            .get(subscription_id)
            .and_then(|s| s.items.first())
            .and_then(|item| state.prices.get(&item.price_id))
            .map(|p| p.unit_amount.get())
            .unwrap_or(0);
        let id = state.next_id("in");
        let invoice = ExternalInvoice {
            id: id.clone(),
            status: Some("draft".to_string()),
            amount_due,
        };
        tracing::debug!(customer_id = %customer_id, invoice_id = %id, "Created in-memory invoice");
        state.invoices.insert(id, invoice.clone());
        Ok(invoice)
    }

    async fn finalize_invoice(&self, invoice_id: &str) -> BillingResult<ExternalInvoice> {
        self.maybe_stall(ProcessorOp::FinalizeInvoice, invoice_id).await;
        self.record(ProcessorOp::FinalizeInvoice, invoice_id)?;
        let mut state = self.lock();
        let invoice = state
            .invoices
            .get_mut(invoice_id)
            .ok_or_else(|| BillingError::StripeApi(format!("No such invoice: {}", invoice_id)))?;
        invoice.status = Some("open".to_string());
        Ok(invoice.clone())
    }
}

/// Factory whose account-scoped handles share one [`InMemoryProcessor`]
#[derive(Clone, Default)]
pub struct InMemoryProcessorFactory {
    processor: InMemoryProcessor,
}

impl InMemoryProcessorFactory {
    pub fn new(processor: InMemoryProcessor) -> Self {
        Self { processor }
    }

    pub fn processor(&self) -> &InMemoryProcessor {
        &self.processor
    }
}

impl ProcessorFactory for InMemoryProcessorFactory {
    fn for_account(&self, account_id: Option<&str>) -> Arc<dyn PaymentProcessor> {
        Arc::new(self.processor.scoped(account_id))
    }
}

/// A notification captured by [`RecordingNotifier`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SentNotification {
    SubscriptionCancelled {
        to: String,
        plan_name: String,
        access_until: Date,
    },
    SubscriptionResumed {
        to: String,
        plan_name: String,
    },
}

/// Notifier that records instead of sending
#[derive(Clone, Default)]
pub struct RecordingNotifier {
    sent: Arc<Mutex<Vec<SentNotification>>>,
    fail: Arc<Mutex<bool>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<SentNotification> {
        self.sent
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Make every send report failure
    pub fn fail_all(&self) {
        *self.fail.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = true;
    }

    fn push(&self, notification: SentNotification) -> bool {
        if *self.fail.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) {
            return false;
        }
        self.sent
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(notification);
        true
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send_subscription_cancelled(
        &self,
        to: &str,
        plan_name: &str,
        access_until: Date,
    ) -> BillingResult<bool> {
        Ok(self.push(SentNotification::SubscriptionCancelled {
            to: to.to_string(),
            plan_name: plan_name.to_string(),
            access_until,
        }))
    }

    async fn send_subscription_resumed(&self, to: &str, plan_name: &str) -> BillingResult<bool> {
        Ok(self.push(SentNotification::SubscriptionResumed {
            to: to.to_string(),
            plan_name: plan_name.to_string(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scoped_handles_share_state() {
        let factory = InMemoryProcessorFactory::default();
        factory
            .processor()
            .add_subscription("sub_1", "cus_1", "price_a", "active", false);

        let scoped = factory.for_account(Some("acct_1"));
        scoped.pause_collection("sub_1").await.unwrap();

        assert!(factory.processor().subscription("sub_1").unwrap().paused);
        let calls = factory.processor().calls_for(ProcessorOp::PauseCollection);
        assert_eq!(calls[0].account_id.as_deref(), Some("acct_1"));
    }

    #[tokio::test]
    async fn test_scripted_failure_targets_one_subscription() {
        let processor = InMemoryProcessor::new();
        processor.add_subscription("sub_1", "cus_1", "price_a", "active", false);
        processor.add_subscription("sub_2", "cus_2", "price_a", "active", false);
        processor.fail(ProcessorOp::SwapPrice, Some("sub_1"));

        assert!(processor.swap_subscription_price("sub_1", "price_b").await.is_err());
        let updated = processor.swap_subscription_price("sub_2", "price_b").await.unwrap();
        assert_eq!(updated.items[0].price_id, "price_b");
    }
}
