//! Billing email notifications
//!
//! Fire-and-forget delivery through an HTTP email provider: one retry
//! attempt at most, failures are logged and never surfaced to the flows that
//! triggered them. Degrades to a no-op when the provider is not configured.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub api_key: String,
    pub from_address: String,
    pub base_url: String,
}

#[derive(Clone)]
pub struct BillingEmailService {
    config: Option<EmailConfig>,
    http: reqwest::Client,
}

impl BillingEmailService {
    pub fn from_env() -> Self {
        let config = std::env::var("RESEND_API_KEY").ok().map(|api_key| EmailConfig {
            api_key,
            from_address: std::env::var("EMAIL_FROM")
                .unwrap_or_else(|_| "billing@vendly.app".to_string()),
            base_url: std::env::var("RESEND_BASE_URL")
                .unwrap_or_else(|_| "https://api.resend.com".to_string()),
        });

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self { config, http }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.is_some()
    }

    /// One reminder email addressed to the whole batch of accounts nearing
    /// trial expiry.
    pub async fn send_trial_ending(&self, recipients: &[String], days_left: i64) {
        if recipients.is_empty() {
            return;
        }
        let subject = format!("Your free trial ends in {days_left} days");
        let body = format!(
            "Your Vendly free trial ends in {days_left} days. \
             Subscribe to keep premium access to your store."
        );
        self.send(recipients, &subject, &body).await;
    }

    pub async fn send_payment_failed(&self, recipient: &str, amount_minor: i64) {
        let subject = "We couldn't process your subscription payment".to_string();
        let body = format!(
            "A renewal charge of {} failed. We'll retry; please check your card \
             to keep premium access.",
            crate::ledger::format_major(amount_minor)
        );
        self.send(std::slice::from_ref(&recipient.to_string()), &subject, &body)
            .await;
    }

    async fn send(&self, recipients: &[String], subject: &str, body: &str) {
        let Some(config) = &self.config else {
            tracing::warn!(subject = subject, "Email provider not configured, skipping send");
            return;
        };

        let payload = serde_json::json!({
            "from": config.from_address,
            "to": recipients,
            "subject": subject,
            "text": body,
        });

        // At most one retry; failure is logged, never propagated.
        for attempt in 0..2 {
            match self
                .http
                .post(format!("{}/emails", config.base_url))
                .bearer_auth(&config.api_key)
                .json(&payload)
                .send()
                .await
            {
                Ok(response) if response.status().is_success() => {
                    tracing::info!(
                        recipients = recipients.len(),
                        subject = subject,
                        "Email sent"
                    );
                    return;
                }
                Ok(response) => {
                    tracing::warn!(
                        attempt = attempt,
                        status = %response.status(),
                        subject = subject,
                        "Email provider rejected send"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        attempt = attempt,
                        error = %e,
                        subject = subject,
                        "Email send failed"
                    );
                }
            }
        }
        tracing::error!(
            recipients = recipients.len(),
            subject = subject,
            "Email dropped after retry"
        );
    }
}
