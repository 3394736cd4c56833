//! Payment gateway REST client
//!
//! Thin typed wrapper over the gateway's JSON API. Every call carries an
//! explicit 10s timeout; timeouts and 5xx responses surface as retryable
//! errors. Idempotent reads retry with bounded exponential backoff; transfer
//! initiation is never auto-retried.

use std::time::Duration;

use serde::Deserialize;
use tokio_retry::strategy::ExponentialBackoff;
use tokio_retry::RetryIf;

use crate::error::{BillingError, BillingResult};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const RETRY_BASE_MS: u64 = 200;
const RETRY_ATTEMPTS: usize = 2; // retries after the first attempt

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Shared secret: authenticates outbound calls and keys the inbound
    /// webhook HMAC.
    pub secret_key: String,
    pub base_url: String,
}

impl GatewayConfig {
    pub fn from_env() -> BillingResult<Self> {
        let secret_key = std::env::var("GATEWAY_SECRET_KEY")
            .map_err(|_| BillingError::Config("GATEWAY_SECRET_KEY not set".into()))?;
        let base_url = std::env::var("GATEWAY_BASE_URL")
            .unwrap_or_else(|_| "https://api.paystack.co".to_string());

        Ok(Self {
            secret_key,
            base_url,
        })
    }
}

/// Gateway response envelope: `{ "status": bool, "message": ..., "data": ... }`.
#[derive(Debug, Deserialize)]
struct ApiEnvelope<T> {
    status: bool,
    message: String,
    data: Option<T>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewaySubscription {
    pub subscription_code: String,
    pub status: String,
    pub amount: i64,
    #[serde(default)]
    pub email_token: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub next_payment_date: Option<time::OffsetDateTime>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Bank {
    pub name: String,
    pub code: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransferHandle {
    pub transfer_code: String,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Clone)]
pub struct GatewayClient {
    config: GatewayConfig,
    http: reqwest::Client,
}

impl GatewayClient {
    pub fn new(config: GatewayConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self { config, http }
    }

    pub fn from_env() -> BillingResult<Self> {
        Ok(Self::new(GatewayConfig::from_env()?))
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Fetch subscription state from the gateway (idempotent, retried).
    pub async fn fetch_subscription(&self, code: &str) -> BillingResult<GatewaySubscription> {
        let url = format!("{}/subscription/{}", self.config.base_url, code);
        self.get_with_retry(&url).await
    }

    /// Banks available for payout recipients (idempotent, retried).
    pub async fn list_banks(&self) -> BillingResult<Vec<Bank>> {
        let url = format!("{}/bank", self.config.base_url);
        self.get_with_retry(&url).await
    }

    /// Switch off auto-renew for a subscription.
    pub async fn disable_subscription(&self, code: &str, email_token: &str) -> BillingResult<()> {
        let url = format!("{}/subscription/disable", self.config.base_url);
        let body = serde_json::json!({ "code": code, "token": email_token });

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.config.secret_key)
            .json(&body)
            .send()
            .await?;

        let envelope: ApiEnvelope<serde_json::Value> = Self::decode(response).await?;
        if !envelope.status {
            return Err(BillingError::Upstream {
                status: None,
                message: envelope.message,
            });
        }
        Ok(())
    }

    /// Initiate a transfer to a payout recipient. Not idempotent at the
    /// gateway, so never auto-retried here.
    pub async fn initiate_transfer(
        &self,
        recipient_code: &str,
        amount_minor: i64,
        reference: &str,
        reason: &str,
    ) -> BillingResult<TransferHandle> {
        let url = format!("{}/transfer", self.config.base_url);
        let body = serde_json::json!({
            "source": "balance",
            "recipient": recipient_code,
            "amount": amount_minor,
            "reference": reference,
            "reason": reason,
        });

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.config.secret_key)
            .json(&body)
            .send()
            .await?;

        let envelope: ApiEnvelope<TransferHandle> = Self::decode(response).await?;
        if !envelope.status {
            return Err(BillingError::Upstream {
                status: None,
                message: envelope.message,
            });
        }
        envelope.data.ok_or_else(|| BillingError::Upstream {
            status: None,
            message: "transfer response missing data".into(),
        })
    }

    async fn get_with_retry<T: serde::de::DeserializeOwned>(&self, url: &str) -> BillingResult<T> {
        let strategy = ExponentialBackoff::from_millis(RETRY_BASE_MS)
            .factor(2)
            .take(RETRY_ATTEMPTS);

        RetryIf::spawn(
            strategy,
            || self.get_once(url),
            |e: &BillingError| e.is_retryable(),
        )
        .await
    }

    async fn get_once<T: serde::de::DeserializeOwned>(&self, url: &str) -> BillingResult<T> {
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.config.secret_key)
            .send()
            .await?;

        let envelope: ApiEnvelope<T> = Self::decode(response).await?;
        if !envelope.status {
            return Err(BillingError::Upstream {
                status: None,
                message: envelope.message,
            });
        }
        envelope.data.ok_or_else(|| BillingError::Upstream {
            status: None,
            message: "gateway response missing data".into(),
        })
    }

    async fn decode<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> BillingResult<ApiEnvelope<T>> {
        let status = response.status();
        if status.is_server_error() {
            return Err(BillingError::Upstream {
                status: Some(status.as_u16()),
                message: format!("gateway returned {status}"),
            });
        }

        response.json::<ApiEnvelope<T>>().await.map_err(|e| {
            BillingError::Upstream {
                status: Some(status.as_u16()),
                message: format!("undecodable gateway response: {e}"),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_decodes_with_and_without_data() {
        let with: ApiEnvelope<TransferHandle> = serde_json::from_str(
            r#"{"status":true,"message":"ok","data":{"transfer_code":"TRF_1","status":"pending"}}"#,
        )
        .unwrap();
        assert!(with.status);
        assert_eq!(with.data.unwrap().transfer_code, "TRF_1");

        let without: ApiEnvelope<TransferHandle> =
            serde_json::from_str(r#"{"status":false,"message":"not found"}"#).unwrap();
        assert!(!without.status);
        assert!(without.data.is_none());
    }

    #[test]
    fn retry_strategy_is_bounded() {
        let strategy = ExponentialBackoff::from_millis(RETRY_BASE_MS)
            .factor(2)
            .take(RETRY_ATTEMPTS);
        assert_eq!(strategy.count(), RETRY_ATTEMPTS);
    }
}
