//! Operator-facing billing alerts
//!
//! Durable records of anomalies that need a human: plans without a price for the
//! current month, subscriptions paused or resumed in bulk, per-item failures in
//! batch operations, failed invoice payments. Alerts are resolved when the
//! underlying condition is repaired.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::store::BillingStore;

/// Alert type classification
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    PlanMissingCurrentPrice,
    SubscriptionsAutoPaused,
    SubscriptionsAutoResumed,
    ResumeFailures,
    ResumeChargeFailed,
    PriceMigrationFailures,
    PaymentFailed,
}

impl AlertType {
    pub const ALL: [AlertType; 7] = [
        Self::PlanMissingCurrentPrice,
        Self::SubscriptionsAutoPaused,
        Self::SubscriptionsAutoResumed,
        Self::ResumeFailures,
        Self::ResumeChargeFailed,
        Self::PriceMigrationFailures,
        Self::PaymentFailed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PlanMissingCurrentPrice => "plan_missing_current_price",
            Self::SubscriptionsAutoPaused => "subscriptions_auto_paused",
            Self::SubscriptionsAutoResumed => "subscriptions_auto_resumed",
            Self::ResumeFailures => "resume_failures",
            Self::ResumeChargeFailed => "resume_charge_failed",
            Self::PriceMigrationFailures => "price_migration_failures",
            Self::PaymentFailed => "payment_failed",
        }
    }

    /// Default severity for this alert type
    pub fn default_severity(&self) -> Severity {
        match self {
            Self::PlanMissingCurrentPrice => Severity::Critical,
            Self::SubscriptionsAutoPaused => Severity::High,
            Self::SubscriptionsAutoResumed => Severity::Low,
            Self::ResumeFailures => Severity::High,
            Self::ResumeChargeFailed => Severity::High,
            Self::PriceMigrationFailures => Severity::High,
            Self::PaymentFailed => Severity::Medium,
        }
    }
}

impl FromStr for AlertType {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| BillingError::Internal(format!("unknown alert type: {}", s)))
    }
}

/// Alert severity level
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl FromStr for Severity {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            other => Err(BillingError::Internal(format!("unknown severity: {}", other))),
        }
    }
}

/// Billing alert
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Alert {
    pub id: Uuid,
    pub alert_type: AlertType,
    pub severity: Severity,
    pub business_id: Option<Uuid>,
    pub plan_id: Option<Uuid>,
    pub stripe_subscription_id: Option<String>,
    pub title: String,
    pub metadata: serde_json::Value,
    pub resolved: bool,
    pub resolved_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
}

impl Alert {
    pub fn new(alert_type: AlertType, title: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            alert_type,
            severity: alert_type.default_severity(),
            business_id: None,
            plan_id: None,
            stripe_subscription_id: None,
            title: title.into(),
            metadata: serde_json::json!({}),
            resolved: false,
            resolved_at: None,
            created_at: OffsetDateTime::now_utc(),
        }
    }

    pub fn severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn business(mut self, business_id: Uuid) -> Self {
        self.business_id = Some(business_id);
        self
    }

    pub fn plan(mut self, plan_id: Uuid) -> Self {
        self.plan_id = Some(plan_id);
        self
    }

    pub fn subscription(mut self, stripe_subscription_id: impl Into<String>) -> Self {
        self.stripe_subscription_id = Some(stripe_subscription_id.into());
        self
    }

    pub fn metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Alert service for raising and resolving billing alerts
#[derive(Clone)]
pub struct AlertService {
    store: Arc<dyn BillingStore>,
}

impl AlertService {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self { store }
    }

    pub async fn raise(&self, alert: Alert) -> BillingResult<Uuid> {
        let id = alert.id;
        tracing::warn!(
            alert_id = %id,
            alert_type = alert.alert_type.as_str(),
            severity = alert.severity.as_str(),
            plan_id = ?alert.plan_id,
            subscription_id = ?alert.stripe_subscription_id,
            "{}",
            alert.title
        );
        self.store.insert_alert(&alert).await?;
        Ok(id)
    }

    /// Raise an alert; a failure to persist it is logged and swallowed
    pub async fn raise_best_effort(&self, alert: Alert) -> Option<Uuid> {
        let alert_type = alert.alert_type;
        match self.raise(alert).await {
            Ok(id) => Some(id),
            Err(e) => {
                tracing::error!(
                    error = %e,
                    alert_type = alert_type.as_str(),
                    "Failed to persist billing alert"
                );
                None
            }
        }
    }

    /// Raise a plan-level alert unless an open one of the same type already exists
    pub async fn raise_once_for_plan(&self, alert: Alert) -> BillingResult<Option<Uuid>> {
        if let Some(plan_id) = alert.plan_id {
            if let Some(existing) = self.store.find_open_alert(plan_id, alert.alert_type).await? {
                tracing::debug!(
                    alert_id = %existing.id,
                    plan_id = %plan_id,
                    alert_type = alert.alert_type.as_str(),
                    "Open alert already exists for plan"
                );
                return Ok(None);
            }
        }
        self.raise(alert).await.map(Some)
    }

    /// Resolve every open alert linked to the given subscriptions.
    ///
    /// `alert_type` narrows the resolution to one kind of alert.
    pub async fn resolve_for_subscriptions(
        &self,
        stripe_subscription_ids: &[String],
        alert_type: Option<AlertType>,
    ) -> BillingResult<u64> {
        if stripe_subscription_ids.is_empty() {
            return Ok(0);
        }
        let resolved = self
            .store
            .resolve_alerts_for_subscriptions(stripe_subscription_ids, alert_type)
            .await?;
        if resolved > 0 {
            tracing::info!(
                resolved,
                subscriptions = stripe_subscription_ids.len(),
                "Resolved subscription alerts"
            );
        }
        Ok(resolved)
    }

    pub async fn resolve_for_plan(&self, plan_id: Uuid, alert_type: AlertType) -> BillingResult<u64> {
        let resolved = self.store.resolve_alerts_for_plan(plan_id, alert_type).await?;
        if resolved > 0 {
            tracing::info!(
                plan_id = %plan_id,
                alert_type = alert_type.as_str(),
                resolved,
                "Resolved plan alerts"
            );
        }
        Ok(resolved)
    }

    pub async fn list_open(&self) -> BillingResult<Vec<Alert>> {
        self.store.list_open_alerts().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::InMemoryBillingStore;

    #[test]
    fn test_alert_type_roundtrip() {
        for alert_type in AlertType::ALL {
            assert_eq!(alert_type.as_str().parse::<AlertType>().unwrap(), alert_type);
        }
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::Low < Severity::Medium);
        assert_eq!(AlertType::SubscriptionsAutoResumed.default_severity(), Severity::Low);
    }

    #[tokio::test]
    async fn test_raise_once_for_plan_deduplicates() {
        let store = Arc::new(InMemoryBillingStore::new());
        let service = AlertService::new(store.clone());
        let plan_id = Uuid::new_v4();

        let first = service
            .raise_once_for_plan(Alert::new(AlertType::PlanMissingCurrentPrice, "missing").plan(plan_id))
            .await
            .unwrap();
        let second = service
            .raise_once_for_plan(Alert::new(AlertType::PlanMissingCurrentPrice, "missing").plan(plan_id))
            .await
            .unwrap();

        assert!(first.is_some());
        assert!(second.is_none());
        assert_eq!(service.list_open().await.unwrap().len(), 1);

        assert_eq!(
            service
                .resolve_for_plan(plan_id, AlertType::PlanMissingCurrentPrice)
                .await
                .unwrap(),
            1
        );
        assert!(service.list_open().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_resolve_for_subscriptions_filters_type() {
        let store = Arc::new(InMemoryBillingStore::new());
        let service = AlertService::new(store.clone());

        service
            .raise(Alert::new(AlertType::PaymentFailed, "payment failed").subscription("sub_1"))
            .await
            .unwrap();
        service
            .raise(Alert::new(AlertType::ResumeChargeFailed, "charge failed").subscription("sub_1"))
            .await
            .unwrap();

        let resolved = service
            .resolve_for_subscriptions(&["sub_1".to_string()], Some(AlertType::PaymentFailed))
            .await
            .unwrap();
        assert_eq!(resolved, 1);

        let open = service.list_open().await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].alert_type, AlertType::ResumeChargeFailed);
    }
}
