//! Business onboarding state machine
//!
//! A connected account's capabilities map deterministically onto an internal
//! readiness status. Status changes are validated against a fixed adjacency
//! table and every change appends one row to the business's transition history.
//!
//! Webhook-sourced changes reflect what the processor already decided, so an
//! illegal move is applied with a warning. User-requested changes are rejected
//! when illegal.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::audit::{ActorType, AuditEntryBuilder, AuditEventType, AuditLogger};
use crate::error::{BillingError, BillingResult};
use crate::models::{Business, OnboardingTransition, TransitionSource};
use crate::store::BillingStore;

/// Internal readiness status of a business
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnboardingStatus {
    /// No connected account yet
    Created,
    ExternalOnboardingRequired,
    OnboardingInProgress,
    PendingVerification,
    OnboardingComplete,
    Restricted,
}

impl OnboardingStatus {
    pub const ALL: [OnboardingStatus; 6] = [
        Self::Created,
        Self::ExternalOnboardingRequired,
        Self::OnboardingInProgress,
        Self::PendingVerification,
        Self::OnboardingComplete,
        Self::Restricted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::ExternalOnboardingRequired => "external_onboarding_required",
            Self::OnboardingInProgress => "onboarding_in_progress",
            Self::PendingVerification => "pending_verification",
            Self::OnboardingComplete => "onboarding_complete",
            Self::Restricted => "restricted",
        }
    }

    /// States a business can be in before it has a connected account
    pub fn is_pre_account(&self) -> bool {
        matches!(self, Self::Created)
    }
}

impl fmt::Display for OnboardingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OnboardingStatus {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| BillingError::InvalidInput(format!("unknown onboarding status: {}", s)))
    }
}

/// Outstanding verification requirements reported for an account
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRequirements {
    #[serde(default)]
    pub currently_due: Vec<String>,
    #[serde(default)]
    pub past_due: Vec<String>,
    #[serde(default)]
    pub disabled_reason: Option<String>,
}

/// The subset of a connected account the state machine reads.
///
/// Deserializes directly from the processor's account object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountCapabilities {
    #[serde(rename = "id")]
    pub account_id: String,
    #[serde(default)]
    pub charges_enabled: bool,
    #[serde(default)]
    pub details_submitted: bool,
    #[serde(default)]
    pub payouts_enabled: bool,
    #[serde(default)]
    pub requirements: AccountRequirements,
    #[serde(default)]
    pub capabilities: BTreeMap<String, String>,
}

/// Map account capabilities onto a readiness status. First matching rule wins.
///
/// `capabilities` is `None` when the business has no connected account.
pub fn determine_state(
    current: OnboardingStatus,
    capabilities: Option<&AccountCapabilities>,
) -> OnboardingStatus {
    let Some(caps) = capabilities else {
        return if current.is_pre_account() {
            current
        } else {
            OnboardingStatus::ExternalOnboardingRequired
        };
    };

    if caps.charges_enabled && caps.details_submitted {
        return OnboardingStatus::OnboardingComplete;
    }

    if !caps.requirements.past_due.is_empty() || caps.requirements.disabled_reason.is_some() {
        return OnboardingStatus::Restricted;
    }

    if caps.details_submitted && !caps.charges_enabled {
        return OnboardingStatus::PendingVerification;
    }

    if !caps.requirements.currently_due.is_empty() || !caps.details_submitted {
        return OnboardingStatus::OnboardingInProgress;
    }

    OnboardingStatus::ExternalOnboardingRequired
}

/// Legal targets from a given status
pub fn allowed_transitions(from: OnboardingStatus) -> &'static [OnboardingStatus] {
    use OnboardingStatus::*;
    match from {
        Created => &[ExternalOnboardingRequired, OnboardingInProgress],
        ExternalOnboardingRequired => &[
            OnboardingInProgress,
            PendingVerification,
            OnboardingComplete,
            Restricted,
        ],
        OnboardingInProgress => &[
            PendingVerification,
            OnboardingComplete,
            Restricted,
            ExternalOnboardingRequired,
        ],
        PendingVerification => &[OnboardingComplete, Restricted, OnboardingInProgress],
        OnboardingComplete => &[Restricted, OnboardingInProgress, PendingVerification],
        Restricted => &[OnboardingInProgress, PendingVerification, OnboardingComplete],
    }
}

pub fn is_valid_transition(from: OnboardingStatus, to: OnboardingStatus) -> bool {
    allowed_transitions(from).contains(&to)
}

/// Result of applying an account update to a business
#[derive(Debug, Clone, PartialEq)]
pub enum OnboardingOutcome {
    Unchanged(OnboardingStatus),
    Transitioned {
        from: OnboardingStatus,
        to: OnboardingStatus,
        /// False when the move was outside the adjacency table
        valid: bool,
    },
}

/// Applies status changes and keeps the transition history
pub struct OnboardingService {
    store: Arc<dyn BillingStore>,
    audit: AuditLogger,
}

impl OnboardingService {
    pub fn new(store: Arc<dyn BillingStore>, audit: AuditLogger) -> Self {
        Self { store, audit }
    }

    /// Handle an `account.updated` event for the business owning the account
    pub async fn apply_account_update(
        &self,
        capabilities: &AccountCapabilities,
        event_id: &str,
    ) -> BillingResult<OnboardingOutcome> {
        let business = self
            .store
            .get_business_by_account(&capabilities.account_id)
            .await?
            .ok_or_else(|| {
                BillingError::NotFound(format!(
                    "business for account {}",
                    capabilities.account_id
                ))
            })?;

        let from = business.onboarding_status;
        let to = determine_state(from, Some(capabilities));

        if from == to {
            tracing::debug!(
                business_id = %business.id,
                status = %from,
                event_id = %event_id,
                "Onboarding status unchanged"
            );
            return Ok(OnboardingOutcome::Unchanged(from));
        }

        let valid = is_valid_transition(from, to);
        if !valid {
            tracing::warn!(
                business_id = %business.id,
                from = %from,
                to = %to,
                event_id = %event_id,
                "Applying onboarding transition outside the adjacency table"
            );
        }

        let reason = describe_capabilities(capabilities);
        self.record_transition(
            &business,
            to,
            reason,
            TransitionSource::Webhook,
            Some(event_id.to_string()),
        )
        .await?;

        if matches!(
            to,
            OnboardingStatus::OnboardingComplete | OnboardingStatus::Restricted
        ) {
            let event_type = if to == OnboardingStatus::OnboardingComplete {
                AuditEventType::OnboardingCompleted
            } else {
                AuditEventType::OnboardingRestricted
            };
            let entry = AuditEntryBuilder::new(event_type, "business", business.id.to_string())
                .business(business.id)
                .actor_type(ActorType::Stripe)
                .stripe_event(event_id)
                .data(serde_json::json!({
                    "from": from.as_str(),
                    "to": to.as_str(),
                    "account_id": capabilities.account_id,
                }))
                .build();
            self.audit.log_best_effort(entry).await;
        }

        tracing::info!(
            business_id = %business.id,
            from = %from,
            to = %to,
            event_id = %event_id,
            "Onboarding status changed"
        );

        Ok(OnboardingOutcome::Transitioned { from, to, valid })
    }

    /// Operator or user requested status change; illegal moves are rejected
    pub async fn request_transition(
        &self,
        business_id: Uuid,
        to: OnboardingStatus,
        reason: &str,
    ) -> BillingResult<OnboardingTransition> {
        let business = self
            .store
            .get_business(business_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("business {}", business_id)))?;

        let from = business.onboarding_status;
        if !is_valid_transition(from, to) {
            return Err(BillingError::InvalidTransition { from, to });
        }

        let transition = self
            .record_transition(&business, to, reason.to_string(), TransitionSource::User, None)
            .await?;

        let entry = AuditEntryBuilder::new(
            AuditEventType::OnboardingTransitionRequested,
            "business",
            business.id.to_string(),
        )
        .business(business.id)
        .actor_type(ActorType::User)
        .data(serde_json::json!({
            "from": from.as_str(),
            "to": to.as_str(),
            "reason": reason,
        }))
        .build();
        self.audit.log_best_effort(entry).await;

        Ok(transition)
    }

    pub async fn history(&self, business_id: Uuid) -> BillingResult<Vec<OnboardingTransition>> {
        self.store.list_transitions(business_id).await
    }

    async fn record_transition(
        &self,
        business: &Business,
        to: OnboardingStatus,
        reason: String,
        source: TransitionSource,
        source_event_id: Option<String>,
    ) -> BillingResult<OnboardingTransition> {
        let transition = OnboardingTransition {
            id: Uuid::new_v4(),
            business_id: business.id,
            from_status: business.onboarding_status,
            to_status: to,
            reason,
            source,
            source_event_id: source_event_id.clone(),
            created_at: OffsetDateTime::now_utc(),
        };

        self.store.append_transition(&transition).await?;
        self.store
            .update_business_status(business.id, to, source_event_id.as_deref())
            .await?;

        Ok(transition)
    }
}

fn describe_capabilities(caps: &AccountCapabilities) -> String {
    let mut parts = vec![
        format!("charges_enabled={}", caps.charges_enabled),
        format!("details_submitted={}", caps.details_submitted),
    ];
    if !caps.requirements.past_due.is_empty() {
        parts.push(format!("past_due={}", caps.requirements.past_due.join(",")));
    }
    if let Some(reason) = &caps.requirements.disabled_reason {
        parts.push(format!("disabled_reason={}", reason));
    }
    if !caps.requirements.currently_due.is_empty() {
        parts.push(format!(
            "currently_due={}",
            caps.requirements.currently_due.len()
        ));
    }
    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::InMemoryBillingStore;

    fn caps(charges: bool, details: bool) -> AccountCapabilities {
        AccountCapabilities {
            account_id: "acct_123".to_string(),
            charges_enabled: charges,
            details_submitted: details,
            ..Default::default()
        }
    }

    #[test]
    fn test_status_string_roundtrip() {
        for status in OnboardingStatus::ALL {
            assert_eq!(status.as_str().parse::<OnboardingStatus>().unwrap(), status);
        }
        assert!("active".parse::<OnboardingStatus>().is_err());
    }

    #[test]
    fn test_no_account_keeps_pre_account_state() {
        assert_eq!(
            determine_state(OnboardingStatus::Created, None),
            OnboardingStatus::Created
        );
        assert_eq!(
            determine_state(OnboardingStatus::OnboardingComplete, None),
            OnboardingStatus::ExternalOnboardingRequired
        );
    }

    #[test]
    fn test_complete_requires_charges_and_details() {
        use OnboardingStatus::*;
        assert_eq!(determine_state(Created, Some(&caps(true, true))), OnboardingComplete);
        assert_eq!(determine_state(Created, Some(&caps(false, true))), PendingVerification);
        assert_eq!(determine_state(Created, Some(&caps(true, false))), OnboardingInProgress);
        assert_eq!(determine_state(Created, Some(&caps(false, false))), OnboardingInProgress);
    }

    #[test]
    fn test_complete_wins_over_restrictions() {
        let mut account = caps(true, true);
        account.requirements.past_due = vec!["external_account".to_string()];
        assert_eq!(
            determine_state(OnboardingStatus::Restricted, Some(&account)),
            OnboardingStatus::OnboardingComplete
        );
    }

    #[test]
    fn test_restricted_on_past_due_or_disabled() {
        let mut past_due = caps(false, true);
        past_due.requirements.past_due = vec!["individual.id_number".to_string()];
        assert_eq!(
            determine_state(OnboardingStatus::PendingVerification, Some(&past_due)),
            OnboardingStatus::Restricted
        );

        let mut disabled = caps(false, false);
        disabled.requirements.disabled_reason = Some("rejected.fraud".to_string());
        assert_eq!(
            determine_state(OnboardingStatus::OnboardingInProgress, Some(&disabled)),
            OnboardingStatus::Restricted
        );
    }

    #[test]
    fn test_determine_state_is_pure() {
        let account = caps(false, true);
        let first = determine_state(OnboardingStatus::Created, Some(&account));
        let second = determine_state(OnboardingStatus::Created, Some(&account));
        assert_eq!(first, second);
    }

    #[test]
    fn test_capabilities_deserialize_from_account_object() {
        let json = serde_json::json!({
            "id": "acct_1",
            "object": "account",
            "charges_enabled": false,
            "details_submitted": true,
            "payouts_enabled": false,
            "requirements": {
                "currently_due": ["tos_acceptance.date"],
                "past_due": [],
                "disabled_reason": null
            },
            "capabilities": { "card_payments": "pending" }
        });
        let parsed: AccountCapabilities = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.account_id, "acct_1");
        assert_eq!(parsed.requirements.currently_due.len(), 1);
        assert_eq!(parsed.capabilities.get("card_payments").unwrap(), "pending");
    }

    #[test]
    fn test_adjacency_table() {
        use OnboardingStatus::*;
        assert!(is_valid_transition(PendingVerification, OnboardingComplete));
        assert!(is_valid_transition(Restricted, OnboardingComplete));
        assert!(!is_valid_transition(Created, OnboardingComplete));
        assert!(!is_valid_transition(OnboardingComplete, Created));
        for status in OnboardingStatus::ALL {
            assert!(!is_valid_transition(status, status));
        }
    }

    #[tokio::test]
    async fn test_webhook_transition_appends_history() {
        let store = Arc::new(InMemoryBillingStore::new());
        let business = store
            .seed_business("Studio", OnboardingStatus::Created, Some("acct_123"))
            .await;
        let service = OnboardingService::new(store.clone(), AuditLogger::new(store.clone()));

        let outcome = service
            .apply_account_update(&caps(false, true), "evt_1")
            .await
            .unwrap();
        assert_eq!(
            outcome,
            OnboardingOutcome::Transitioned {
                from: OnboardingStatus::Created,
                to: OnboardingStatus::PendingVerification,
                valid: false,
            }
        );

        let outcome = service
            .apply_account_update(&caps(true, true), "evt_2")
            .await
            .unwrap();
        assert!(matches!(outcome, OnboardingOutcome::Transitioned { valid: true, .. }));

        let history = service.history(business.id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].from_status, OnboardingStatus::PendingVerification);
        assert_eq!(history[1].to_status, OnboardingStatus::OnboardingComplete);
        assert_eq!(history[1].source_event_id.as_deref(), Some("evt_2"));

        let stored = store.get_business(business.id).await.unwrap().unwrap();
        assert_eq!(stored.onboarding_status, OnboardingStatus::OnboardingComplete);
        assert_eq!(stored.last_processed_event_id.as_deref(), Some("evt_2"));
    }

    #[tokio::test]
    async fn test_repeated_update_is_unchanged() {
        let store = Arc::new(InMemoryBillingStore::new());
        let business = store
            .seed_business("Studio", OnboardingStatus::PendingVerification, Some("acct_123"))
            .await;
        let service = OnboardingService::new(store.clone(), AuditLogger::new(store.clone()));

        let outcome = service
            .apply_account_update(&caps(false, true), "evt_1")
            .await
            .unwrap();
        assert_eq!(
            outcome,
            OnboardingOutcome::Unchanged(OnboardingStatus::PendingVerification)
        );
        assert!(service.history(business.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_user_transition_rejects_illegal_move() {
        let store = Arc::new(InMemoryBillingStore::new());
        let business = store
            .seed_business("Studio", OnboardingStatus::Created, None)
            .await;
        let service = OnboardingService::new(store.clone(), AuditLogger::new(store.clone()));

        let err = service
            .request_transition(business.id, OnboardingStatus::OnboardingComplete, "skip")
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::InvalidTransition { .. }));
        assert!(service.history(business.id).await.unwrap().is_empty());

        let transition = service
            .request_transition(
                business.id,
                OnboardingStatus::ExternalOnboardingRequired,
                "started onboarding",
            )
            .await
            .unwrap();
        assert_eq!(transition.source, TransitionSource::User);
        assert!(transition.source_event_id.is_none());
    }
}
