//! Failed event replay
//!
//! Re-dispatches stored webhook events whose handler failed and that Stripe
//! has not successfully redelivered within the grace period.

use memberpass_billing::{BillingService, ReceiveOutcome};
use std::time::Duration;
use time::OffsetDateTime;
use tracing::{error, info, warn};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReplayReport {
    pub considered: usize,
    pub replayed: usize,
    /// Processed by a concurrent delivery between listing and replay
    pub already_processed: usize,
    pub failed: usize,
}

/// Replay one batch of failed events received before `now - grace`
pub async fn replay_failed_events(
    billing: &BillingService,
    now: OffsetDateTime,
    grace: Duration,
    limit: i64,
) -> ReplayReport {
    let older_than = now - grace;
    let events = match billing.store.list_failed_events(older_than, limit).await {
        Ok(events) => events,
        Err(e) => {
            error!(error = %e, "Failed to list events for replay");
            return ReplayReport::default();
        }
    };

    if events.is_empty() {
        return ReplayReport::default(); // No work to do
    }

    info!(count = events.len(), "Replaying failed events");

    let mut report = ReplayReport {
        considered: events.len(),
        ..Default::default()
    };
    for event in events {
        match billing.events.replay(&event.id).await {
            Ok(ReceiveOutcome::Processed { outcome, .. }) => {
                report.replayed += 1;
                info!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    outcome = ?outcome,
                    "Replayed event"
                );
            }
            Ok(ReceiveOutcome::Duplicate { .. }) => report.already_processed += 1,
            Err(e) => {
                report.failed += 1;
                warn!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    attempts = event.attempts + 1,
                    error = %e,
                    "Event replay failed, will retry"
                );
            }
        }
    }

    info!(
        considered = report.considered,
        replayed = report.replayed,
        already_processed = report.already_processed,
        failed = report.failed,
        "Event replay cycle complete"
    );

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use memberpass_billing::store::BillingStore;
    use memberpass_billing::testing::{InMemoryProcessorFactory, ProcessorOp, RecordingNotifier};
    use memberpass_billing::{InMemoryBillingStore, OnboardingStatus, PricingMode, WebhookVerifier};
    use std::sync::Arc;

    struct Fixture {
        store: Arc<InMemoryBillingStore>,
        processor: InMemoryProcessorFactory,
        verifier: WebhookVerifier,
        billing: BillingService,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryBillingStore::new());
        let processor = InMemoryProcessorFactory::default();
        let verifier = WebhookVerifier::new("whsec_worker_test", 300);
        let billing = BillingService::new(
            store.clone(),
            Arc::new(processor.clone()),
            Arc::new(RecordingNotifier::new()),
            verifier.clone(),
            Duration::from_secs(5),
        );
        Fixture {
            store,
            processor,
            verifier,
            billing,
        }
    }

    impl Fixture {
        async fn deliver_checkout(&self, event_id: &str, subscription_id: &str, plan_id: String) {
            let payload = serde_json::json!({
                "id": event_id,
                "type": "checkout.session.completed",
                "account": null,
                "data": { "object": {
                    "id": format!("cs_{}", subscription_id),
                    "customer": "cus_1",
                    "customer_email": "member@example.com",
                    "subscription": subscription_id,
                    "metadata": { "plan_id": plan_id }
                }}
            })
            .to_string();
            let signature = self
                .verifier
                .sign(&payload, OffsetDateTime::now_utc().unix_timestamp())
                .unwrap();
            // Handler failure is expected; the event stays unprocessed
            let _ = self.billing.events.receive(&payload, &signature).await;
        }
    }

    #[tokio::test]
    async fn test_replays_failed_events_after_grace() {
        let f = fixture();
        let business = f
            .store
            .seed_business("Gym", OnboardingStatus::OnboardingComplete, None)
            .await;
        let plan = f
            .store
            .seed_plan(business.id, "Gold", PricingMode::Fixed, Some("price_a"))
            .await;
        for id in ["sub_1", "sub_2"] {
            f.processor
                .processor()
                .add_subscription(id, "cus_1", "price_a", "active", false);
        }
        f.processor.processor().fail(ProcessorOp::RetrieveSubscription, None);
        f.deliver_checkout("evt_1", "sub_1", plan.id.to_string()).await;
        f.deliver_checkout("evt_2", "sub_2", plan.id.to_string()).await;
        assert!(!f.store.get_event("evt_1").await.unwrap().unwrap().processed);

        // Inside the grace period nothing is touched
        let grace = Duration::from_secs(600);
        let early = replay_failed_events(&f.billing, OffsetDateTime::now_utc(), grace, 10).await;
        assert_eq!(early, ReplayReport::default());

        // Still failing: counted, left for the next cycle
        let later = OffsetDateTime::now_utc() + Duration::from_secs(3600);
        let report = replay_failed_events(&f.billing, later, grace, 10).await;
        assert_eq!(report.considered, 2);
        assert_eq!(report.failed, 2);
        assert_eq!(f.store.get_event("evt_1").await.unwrap().unwrap().attempts, 2);

        f.processor.processor().clear_failures();
        let report = replay_failed_events(&f.billing, later, grace, 10).await;
        assert_eq!(report.replayed, 2);
        assert!(f.store.get_event("evt_2").await.unwrap().unwrap().processed);
        assert!(f.store.find_current_subscription("sub_2").await.unwrap().is_some());

        // Nothing left to replay
        let report = replay_failed_events(&f.billing, later, grace, 10).await;
        assert_eq!(report.considered, 0);
    }

    #[tokio::test]
    async fn test_batch_limit_takes_oldest_first() {
        let f = fixture();
        let business = f
            .store
            .seed_business("Gym", OnboardingStatus::OnboardingComplete, None)
            .await;
        let plan = f
            .store
            .seed_plan(business.id, "Gold", PricingMode::Fixed, Some("price_a"))
            .await;
        f.processor.processor().fail(ProcessorOp::RetrieveSubscription, None);
        for n in 0..3 {
            let sub = format!("sub_{}", n);
            f.processor
                .processor()
                .add_subscription(&sub, "cus_1", "price_a", "active", false);
            f.deliver_checkout(&format!("evt_{}", n), &sub, plan.id.to_string()).await;
        }

        let later = OffsetDateTime::now_utc() + Duration::from_secs(3600);
        let report = replay_failed_events(&f.billing, later, Duration::from_secs(60), 2).await;
        assert_eq!(report.considered, 2);
    }
}
