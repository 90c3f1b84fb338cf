//! Member notifications for billing events
//!
//! Sends transactional emails via Resend API. Delivery is best-effort: a failed
//! send is logged and reported as `Ok(false)`, never as an error that would
//! fail webhook processing.

use async_trait::async_trait;
use time::macros::format_description;
use time::Date;

use crate::error::BillingResult;

/// Dispatches member-facing notifications
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Subscription ended; the member keeps access until `access_until`
    async fn send_subscription_cancelled(
        &self,
        to: &str,
        plan_name: &str,
        access_until: Date,
    ) -> BillingResult<bool>;

    async fn send_subscription_resumed(&self, to: &str, plan_name: &str) -> BillingResult<bool>;
}

/// Email configuration
#[derive(Debug, Clone)]
pub struct EmailConfig {
    /// Resend API key
    pub resend_api_key: String,
    /// From address for emails
    pub email_from: String,
    /// App name for branding
    pub app_name: String,
}

impl EmailConfig {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        Self {
            resend_api_key: std::env::var("RESEND_API_KEY").unwrap_or_default(),
            email_from: std::env::var("EMAIL_FROM")
                .unwrap_or_else(|_| "Memberpass <noreply@memberpass.app>".to_string()),
            app_name: std::env::var("APP_NAME").unwrap_or_else(|_| "Memberpass".to_string()),
        }
    }

    /// Check if email sending is enabled
    pub fn is_enabled(&self) -> bool {
        !self.resend_api_key.is_empty()
    }
}

/// Resend-backed notifier
#[derive(Clone)]
pub struct ResendNotifier {
    config: EmailConfig,
    client: reqwest::Client,
}

impl ResendNotifier {
    pub fn new(config: EmailConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    pub fn from_env() -> Self {
        Self::new(EmailConfig::from_env())
    }

    async fn send_email(&self, to: &str, subject: &str, html: &str) -> BillingResult<bool> {
        if !self.config.is_enabled() {
            tracing::warn!(to = %to, subject = %subject, "Email not configured, skipping");
            return Ok(false);
        }

        let body = serde_json::json!({
            "from": self.config.email_from,
            "to": [to],
            "subject": subject,
            "html": html
        });

        let response = self
            .client
            .post("https://api.resend.com/emails")
            .bearer_auth(&self.config.resend_api_key)
            .json(&body)
            .send()
            .await;

        match response {
            Ok(resp) if resp.status().is_success() => {
                tracing::info!(to = %to, subject = %subject, "Billing email sent");
                Ok(true)
            }
            Ok(resp) => {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                tracing::error!(
                    to = %to,
                    subject = %subject,
                    status = %status,
                    body = %body,
                    "Failed to send billing email - non-fatal"
                );
                Ok(false)
            }
            Err(e) => {
                tracing::error!(
                    to = %to,
                    subject = %subject,
                    error = %e,
                    "Failed to send billing email - non-fatal"
                );
                Ok(false)
            }
        }
    }
}

/// Human-readable date such as "July 31, 2026"
pub fn format_access_date(date: Date) -> String {
    let format = format_description!("[month repr:long] [day padding:none], [year]");
    date.format(&format).unwrap_or_else(|_| date.to_string())
}

#[async_trait]
impl Notifier for ResendNotifier {
    async fn send_subscription_cancelled(
        &self,
        to: &str,
        plan_name: &str,
        access_until: Date,
    ) -> BillingResult<bool> {
        let html = format!(
            "<p>Your <strong>{plan_name}</strong> membership has been cancelled.</p>\
             <p>You keep access until <strong>{until}</strong>.</p>",
            plan_name = plan_name,
            until = format_access_date(access_until),
        );
        self.send_email(
            to,
            &format!("Membership cancelled - {}", self.config.app_name),
            &html,
        )
        .await
    }

    async fn send_subscription_resumed(&self, to: &str, plan_name: &str) -> BillingResult<bool> {
        let html = format!(
            "<p>Your <strong>{plan_name}</strong> membership is active again.</p>",
            plan_name = plan_name,
        );
        self.send_email(
            to,
            &format!("Membership resumed - {}", self.config.app_name),
            &html,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::date;

    #[test]
    fn test_format_access_date() {
        assert_eq!(format_access_date(date!(2026 - 07 - 31)), "July 31, 2026");
        assert_eq!(format_access_date(date!(2026 - 08 - 01)), "August 1, 2026");
    }

    #[tokio::test]
    async fn test_disabled_email_is_not_an_error() {
        let notifier = ResendNotifier::new(EmailConfig {
            resend_api_key: String::new(),
            email_from: "test@example.com".to_string(),
            app_name: "Test".to_string(),
        });
        let sent = notifier
            .send_subscription_cancelled("a@example.com", "Gold", date!(2026 - 07 - 31))
            .await
            .unwrap();
        assert!(!sent);
    }
}
