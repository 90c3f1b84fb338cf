//! Idempotent inbound event log
//!
//! Every verified Stripe event is written to `stripe_events` before any handler
//! runs. The row is keyed by the event id alone, so a redelivery finds the row
//! its earlier attempt left behind:
//!
//! - already processed: acknowledged without running the handler again
//! - previously failed: dispatched again against the same row
//!
//! Handler failures are recorded on the row and surfaced to the caller so the
//! processor redelivers the event. Nothing is retried in-process.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use std::sync::Arc;
use time::OffsetDateTime;

use crate::dispatcher::DispatchOutcome;
use crate::error::{BillingError, BillingResult};
use crate::models::InboundEvent;
use crate::store::{BillingStore, EventRecord};

type HmacSha256 = Hmac<Sha256>;

/// Verifies the `Stripe-Signature` header (`t=<unix>,v1=<hex hmac>`)
#[derive(Clone)]
pub struct WebhookVerifier {
    secret: String,
    tolerance_secs: i64,
}

impl WebhookVerifier {
    pub fn new(secret: impl Into<String>, tolerance_secs: i64) -> Self {
        Self {
            secret: secret.into(),
            tolerance_secs,
        }
    }

    pub fn verify(&self, payload: &str, signature: &str) -> BillingResult<()> {
        self.verify_at(payload, signature, OffsetDateTime::now_utc().unix_timestamp())
    }

    /// Verify against an explicit clock
    pub fn verify_at(&self, payload: &str, signature: &str, now: i64) -> BillingResult<()> {
        let mut timestamp: Option<i64> = None;
        let mut candidates: Vec<&str> = Vec::new();

        for part in signature.split(',') {
            match part.trim().split_once('=') {
                Some(("t", value)) => timestamp = value.parse().ok(),
                Some(("v1", value)) => candidates.push(value),
                _ => {}
            }
        }

        let timestamp = timestamp.ok_or_else(|| {
            tracing::warn!("Missing timestamp in signature header");
            BillingError::WebhookSignatureInvalid
        })?;

        if candidates.is_empty() {
            tracing::warn!("Missing v1 signature in signature header");
            return Err(BillingError::WebhookSignatureInvalid);
        }

        if (now - timestamp).abs() > self.tolerance_secs {
            tracing::warn!(
                timestamp,
                now,
                diff = (now - timestamp).abs(),
                "Webhook timestamp outside tolerance"
            );
            return Err(BillingError::WebhookSignatureInvalid);
        }

        let signed_payload = format!("{}.{}", timestamp, payload);
        let matched = candidates.iter().any(|candidate| {
            let Ok(expected) = hex::decode(candidate) else {
                return false;
            };
            let Ok(mut mac) = HmacSha256::new_from_slice(self.secret.as_bytes()) else {
                return false;
            };
            mac.update(signed_payload.as_bytes());
            mac.verify_slice(&expected).is_ok()
        });

        if !matched {
            tracing::warn!("Webhook signature mismatch");
            return Err(BillingError::WebhookSignatureInvalid);
        }

        Ok(())
    }

    /// Produce a header value for `payload` signed at `timestamp`
    pub fn sign(&self, payload: &str, timestamp: i64) -> BillingResult<String> {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|_| BillingError::Config("Invalid webhook secret key".to_string()))?;
        mac.update(format!("{}.{}", timestamp, payload).as_bytes());
        Ok(format!(
            "t={},v1={}",
            timestamp,
            hex::encode(mac.finalize().into_bytes())
        ))
    }
}

#[derive(Debug, Clone, Deserialize)]
struct EnvelopeData {
    object: serde_json::Value,
}

/// The parts of a Stripe event envelope the engine reads
#[derive(Debug, Clone, Deserialize)]
pub struct EventEnvelope {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    /// Connected account the event originated from
    #[serde(default)]
    pub account: Option<String>,
    #[serde(default)]
    pub created: i64,
    data: EnvelopeData,
}

impl EventEnvelope {
    pub fn parse(payload: &str) -> BillingResult<Self> {
        serde_json::from_str(payload).map_err(|e| BillingError::WebhookPayloadInvalid(e.to_string()))
    }

    /// `data.object` of the event
    pub fn object(&self) -> &serde_json::Value {
        &self.data.object
    }

    /// Deserialize `data.object` into a typed shape
    pub fn object_as<T: serde::de::DeserializeOwned>(&self) -> BillingResult<T> {
        serde_json::from_value(self.data.object.clone()).map_err(|e| {
            BillingError::WebhookPayloadInvalid(format!(
                "{} object for {}: {}",
                self.event_type, self.id, e
            ))
        })
    }
}

/// Runs the business logic for one event
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &EventEnvelope) -> BillingResult<DispatchOutcome>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReceiveOutcome {
    /// Handler ran and the event is now marked processed
    Processed {
        event_id: String,
        outcome: DispatchOutcome,
    },
    /// Event was already processed by an earlier delivery
    Duplicate { event_id: String },
}

/// Durable log in front of the event handler
pub struct EventLog {
    store: Arc<dyn BillingStore>,
    verifier: WebhookVerifier,
    handler: Arc<dyn EventHandler>,
}

impl EventLog {
    pub fn new(
        store: Arc<dyn BillingStore>,
        verifier: WebhookVerifier,
        handler: Arc<dyn EventHandler>,
    ) -> Self {
        Self {
            store,
            verifier,
            handler,
        }
    }

    /// Verify, persist, then dispatch one webhook delivery
    pub async fn receive(&self, payload: &str, signature: &str) -> BillingResult<ReceiveOutcome> {
        self.verifier.verify(payload, signature)?;
        let envelope = EventEnvelope::parse(payload)?;

        let record = self
            .store
            .record_event(&InboundEvent {
                id: envelope.id.clone(),
                event_type: envelope.event_type.clone(),
                payload: payload.to_string(),
                signature_valid: true,
                account_id: envelope.account.clone(),
                processed: false,
                processing_error: None,
                attempts: 0,
                created_at: OffsetDateTime::now_utc(),
                processed_at: None,
            })
            .await?;

        match &record {
            EventRecord::Existing(stored) if stored.processed => {
                tracing::info!(
                    event_id = %stored.id,
                    event_type = %stored.event_type,
                    "Event already processed, acknowledging redelivery"
                );
                return Ok(ReceiveOutcome::Duplicate {
                    event_id: stored.id.clone(),
                });
            }
            EventRecord::Existing(stored) => {
                tracing::info!(
                    event_id = %stored.id,
                    attempts = stored.attempts,
                    previous_error = ?stored.processing_error,
                    "Redelivery of unprocessed event, dispatching again"
                );
            }
            EventRecord::Inserted(stored) => {
                tracing::debug!(
                    event_id = %stored.id,
                    event_type = %stored.event_type,
                    account_id = ?stored.account_id,
                    "Recorded inbound event"
                );
            }
        }

        self.dispatch(&envelope).await
    }

    /// Dispatch a stored event again from its persisted payload
    pub async fn replay(&self, event_id: &str) -> BillingResult<ReceiveOutcome> {
        let stored = self
            .store
            .get_event(event_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("event {}", event_id)))?;

        if stored.processed {
            return Ok(ReceiveOutcome::Duplicate {
                event_id: stored.id,
            });
        }

        tracing::info!(
            event_id = %stored.id,
            event_type = %stored.event_type,
            attempts = stored.attempts,
            "Replaying stored event"
        );

        let envelope = EventEnvelope::parse(&stored.payload)?;
        self.dispatch(&envelope).await
    }

    async fn dispatch(&self, envelope: &EventEnvelope) -> BillingResult<ReceiveOutcome> {
        match self.handler.handle(envelope).await {
            Ok(outcome) => {
                self.store
                    .mark_event_processed(&envelope.id, OffsetDateTime::now_utc())
                    .await?;
                tracing::info!(
                    event_id = %envelope.id,
                    event_type = %envelope.event_type,
                    outcome = ?outcome,
                    "Event processed"
                );
                Ok(ReceiveOutcome::Processed {
                    event_id: envelope.id.clone(),
                    outcome,
                })
            }
            Err(e) => {
                let message = e.to_string();
                tracing::error!(
                    event_id = %envelope.id,
                    event_type = %envelope.event_type,
                    error = %message,
                    "Event handler failed"
                );
                if let Err(mark_err) = self.store.mark_event_failed(&envelope.id, &message).await {
                    tracing::error!(
                        event_id = %envelope.id,
                        error = %mark_err,
                        "Failed to record event handler error"
                    );
                }
                Err(BillingError::WebhookHandlerFailed {
                    event_id: envelope.id.clone(),
                    message,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::InMemoryBillingStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    const SECRET: &str = "whsec_test_secret_value";

    /// Handler that checks the event row exists before it runs
    struct CheckingHandler {
        store: Arc<InMemoryBillingStore>,
        calls: AtomicUsize,
        fail: Mutex<bool>,
        fail_event: Mutex<Option<String>>,
    }

    #[async_trait]
    impl EventHandler for CheckingHandler {
        async fn handle(&self, event: &EventEnvelope) -> BillingResult<DispatchOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            assert!(self.store.get_event(&event.id).await.unwrap().is_some());
            let targeted = self.fail_event.lock().unwrap().as_deref() == Some(event.id.as_str());
            if targeted || *self.fail.lock().unwrap() {
                return Err(BillingError::Internal("handler exploded".to_string()));
            }
            Ok(DispatchOutcome::Handled)
        }
    }

    fn setup() -> (Arc<InMemoryBillingStore>, Arc<CheckingHandler>, EventLog) {
        let store = Arc::new(InMemoryBillingStore::new());
        let handler = Arc::new(CheckingHandler {
            store: store.clone(),
            calls: AtomicUsize::new(0),
            fail: Mutex::new(false),
            fail_event: Mutex::new(None),
        });
        let log = EventLog::new(
            store.clone(),
            WebhookVerifier::new(SECRET, 300),
            handler.clone(),
        );
        (store, handler, log)
    }

    fn payload(id: &str) -> String {
        serde_json::json!({
            "id": id,
            "type": "customer.subscription.updated",
            "account": "acct_1",
            "created": 1782864000,
            "data": { "object": { "id": "sub_1" } }
        })
        .to_string()
    }

    fn signed(payload: &str) -> String {
        WebhookVerifier::new(SECRET, 300)
            .sign(payload, OffsetDateTime::now_utc().unix_timestamp())
            .unwrap()
    }

    #[test]
    fn test_verify_rejects_tampering_and_stale_timestamps() {
        let verifier = WebhookVerifier::new(SECRET, 300);
        let header = verifier.sign("{}", 1_000).unwrap();

        assert!(verifier.verify_at("{}", &header, 1_100).is_ok());
        assert!(verifier.verify_at("{ }", &header, 1_100).is_err());
        assert!(verifier.verify_at("{}", &header, 1_400).is_err());
        assert!(verifier.verify_at("{}", "v1=deadbeef", 1_000).is_err());
        assert!(verifier.verify_at("{}", "t=1000", 1_000).is_err());

        let other = WebhookVerifier::new("whsec_other", 300);
        assert!(other.verify_at("{}", &header, 1_100).is_err());
    }

    #[test]
    fn test_verify_accepts_any_matching_v1() {
        let verifier = WebhookVerifier::new(SECRET, 300);
        let header = verifier.sign("{}", 1_000).unwrap();
        let rotated = header.replacen("t=1000,", "t=1000,v1=00ff,", 1);
        assert!(verifier.verify_at("{}", &rotated, 1_000).is_ok());
    }

    #[tokio::test]
    async fn test_invalid_signature_is_not_persisted() {
        let (store, handler, log) = setup();
        let body = payload("evt_1");

        let err = log.receive(&body, "t=1,v1=abcd").await.unwrap_err();
        assert!(matches!(err, BillingError::WebhookSignatureInvalid));
        assert!(store.events().await.is_empty());
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_event_is_stored_before_dispatch_and_marked_processed() {
        let (store, handler, log) = setup();
        let body = payload("evt_1");

        let outcome = log.receive(&body, &signed(&body)).await.unwrap();
        assert!(matches!(outcome, ReceiveOutcome::Processed { .. }));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);

        let stored = store.get_event("evt_1").await.unwrap().unwrap();
        assert!(stored.processed);
        assert!(stored.signature_valid);
        assert_eq!(stored.payload, body);
        assert_eq!(stored.account_id.as_deref(), Some("acct_1"));
    }

    #[tokio::test]
    async fn test_processed_redelivery_is_not_dispatched() {
        let (_store, handler, log) = setup();
        let body = payload("evt_1");

        log.receive(&body, &signed(&body)).await.unwrap();
        let second = log.receive(&body, &signed(&body)).await.unwrap();

        assert_eq!(
            second,
            ReceiveOutcome::Duplicate {
                event_id: "evt_1".to_string()
            }
        );
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_event_is_redispatched_on_redelivery() {
        let (store, handler, log) = setup();
        let body = payload("evt_1");
        *handler.fail.lock().unwrap() = true;

        let err = log.receive(&body, &signed(&body)).await.unwrap_err();
        assert!(matches!(err, BillingError::WebhookHandlerFailed { .. }));
        let stored = store.get_event("evt_1").await.unwrap().unwrap();
        assert!(!stored.processed);
        assert!(stored.processing_error.unwrap().contains("handler exploded"));

        *handler.fail.lock().unwrap() = false;
        log.receive(&body, &signed(&body)).await.unwrap();

        let stored = store.get_event("evt_1").await.unwrap().unwrap();
        assert!(stored.processed);
        assert!(stored.processing_error.is_none());
        assert_eq!(stored.attempts, 2);
        assert_eq!(store.events().await.len(), 1);
    }

    #[tokio::test]
    async fn test_distinct_events_of_same_type_are_independent() {
        let (store, handler, log) = setup();
        let first = payload("evt_1");
        let second = payload("evt_2");

        log.receive(&first, &signed(&first)).await.unwrap();
        log.receive(&second, &signed(&second)).await.unwrap();

        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
        assert!(store.get_event("evt_2").await.unwrap().unwrap().processed);
    }

    #[tokio::test]
    async fn test_failure_stays_with_its_own_event() {
        let (store, handler, log) = setup();
        *handler.fail_event.lock().unwrap() = Some("evt_1".to_string());
        let first = payload("evt_1");
        let second = payload("evt_2");
        let (first_sig, second_sig) = (signed(&first), signed(&second));

        let (failed, ok) = tokio::join!(
            log.receive(&first, &first_sig),
            log.receive(&second, &second_sig)
        );
        assert!(matches!(failed, Err(BillingError::WebhookHandlerFailed { .. })));
        assert!(matches!(ok, Ok(ReceiveOutcome::Processed { .. })));

        let evt_1 = store.get_event("evt_1").await.unwrap().unwrap();
        assert!(!evt_1.processed);
        assert!(evt_1.processing_error.is_some());
        let evt_2 = store.get_event("evt_2").await.unwrap().unwrap();
        assert!(evt_2.processed);
        assert!(evt_2.processing_error.is_none());

        let later = OffsetDateTime::now_utc() + time::Duration::hours(1);
        let pending: Vec<_> = store
            .list_failed_events(later, 10)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(pending, vec!["evt_1".to_string()]);
    }

    #[tokio::test]
    async fn test_replay_failed_event() {
        let (store, handler, log) = setup();
        let body = payload("evt_1");
        *handler.fail.lock().unwrap() = true;
        let _ = log.receive(&body, &signed(&body)).await;

        *handler.fail.lock().unwrap() = false;
        let outcome = log.replay("evt_1").await.unwrap();
        assert!(matches!(outcome, ReceiveOutcome::Processed { .. }));
        assert!(store.get_event("evt_1").await.unwrap().unwrap().processed);

        assert!(matches!(
            log.replay("evt_1").await.unwrap(),
            ReceiveOutcome::Duplicate { .. }
        ));
        assert!(matches!(
            log.replay("evt_missing").await.unwrap_err(),
            BillingError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_malformed_payload_with_valid_signature() {
        let (store, _handler, log) = setup();
        let body = "{\"not\":\"an event\"}";
        let err = log.receive(body, &signed(body)).await.unwrap_err();
        assert!(matches!(err, BillingError::WebhookPayloadInvalid(_)));
        assert!(store.events().await.is_empty());
    }
}
