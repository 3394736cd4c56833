//! Gateway event envelope and typed payloads
//!
//! Every inbound webhook is a JSON envelope `{ "event": "...", "data": {...} }`.
//! Payloads are deserialized into typed structs up front; anything missing a
//! required field fails with `MalformedPayload` before a single row is
//! touched (no partial writes).

use serde::Deserialize;
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};

/// Header carrying the hex HMAC-SHA512 of the raw request body.
pub const SIGNATURE_HEADER: &str = "x-paystack-signature";

/// Raw webhook envelope as delivered by the gateway.
#[derive(Debug, Clone, Deserialize)]
pub struct EventEnvelope {
    pub event: String,
    pub data: serde_json::Value,
}

/// Event types this service reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    SubscriptionCreate,
    SubscriptionNotRenew,
    SubscriptionDisable,
    ChargeSuccess,
    InvoiceCreate,
    InvoiceUpdate,
    InvoicePaymentFailed,
    TransferSuccess,
    TransferFailed,
    TransferReversed,
    Unknown,
}

impl EventEnvelope {
    pub fn parse(raw: &[u8]) -> BillingResult<Self> {
        serde_json::from_slice(raw)
            .map_err(|e| BillingError::malformed(format!("invalid event envelope: {e}")))
    }

    pub fn kind(&self) -> EventKind {
        match self.event.as_str() {
            "subscription.create" => EventKind::SubscriptionCreate,
            "subscription.not_renew" => EventKind::SubscriptionNotRenew,
            "subscription.disable" => EventKind::SubscriptionDisable,
            "charge.success" => EventKind::ChargeSuccess,
            "invoice.create" => EventKind::InvoiceCreate,
            "invoice.update" => EventKind::InvoiceUpdate,
            "invoice.payment_failed" => EventKind::InvoicePaymentFailed,
            "transfer.success" => EventKind::TransferSuccess,
            "transfer.failed" => EventKind::TransferFailed,
            "transfer.reversed" => EventKind::TransferReversed,
            _ => EventKind::Unknown,
        }
    }

    /// Stable identity for idempotency checks.
    ///
    /// The gateway does not ship a dedicated event id, so identity is
    /// `{event}:{data.id}` when the payload carries an id, otherwise the
    /// SHA-256 of the raw body (re-deliveries are byte-identical).
    pub fn event_id(&self, raw: &[u8]) -> String {
        match self.data.get("id").and_then(|v| v.as_i64()) {
            Some(id) => format!("{}:{}", self.event, id),
            None => hex::encode(Sha256::digest(raw)),
        }
    }

    pub fn subscription(&self) -> BillingResult<SubscriptionPayload> {
        let payload: SubscriptionPayload = self.typed()?;
        if payload.subscription_code.is_empty() {
            return Err(BillingError::malformed("empty subscription_code"));
        }
        Ok(payload)
    }

    pub fn charge(&self) -> BillingResult<ChargePayload> {
        let payload: ChargePayload = self.typed()?;
        if payload.reference.is_empty() {
            return Err(BillingError::malformed("empty charge reference"));
        }
        if payload.amount <= 0 {
            return Err(BillingError::malformed("non-positive charge amount"));
        }
        Ok(payload)
    }

    pub fn invoice(&self) -> BillingResult<InvoicePayload> {
        let payload: InvoicePayload = self.typed()?;
        if payload.invoice_code.is_empty() {
            return Err(BillingError::malformed("empty invoice_code"));
        }
        Ok(payload)
    }

    pub fn transfer(&self) -> BillingResult<TransferPayload> {
        let payload: TransferPayload = self.typed()?;
        if payload.reference.is_empty() {
            return Err(BillingError::malformed("empty transfer reference"));
        }
        Ok(payload)
    }

    fn typed<T: serde::de::DeserializeOwned>(&self) -> BillingResult<T> {
        serde_json::from_value(self.data.clone()).map_err(|e| {
            BillingError::malformed(format!("{} payload: {e}", self.event))
        })
    }
}

/// `subscription.create` / `subscription.not_renew` / `subscription.disable`
#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionPayload {
    pub subscription_code: String,
    #[serde(default)]
    pub status: Option<String>,
    pub amount: i64,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub next_payment_date: Option<OffsetDateTime>,
    pub plan: PlanPayload,
    pub customer: CustomerPayload,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlanPayload {
    #[serde(default)]
    pub plan_code: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    /// Billing interval: hourly, daily, weekly, monthly, quarterly,
    /// biannually or annually.
    #[serde(default)]
    pub interval: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CustomerPayload {
    pub email: String,
    #[serde(default)]
    pub customer_code: Option<String>,
}

/// `charge.success`. Carries a plan object only for subscription charges.
#[derive(Debug, Clone, Deserialize)]
pub struct ChargePayload {
    #[serde(default)]
    pub id: Option<i64>,
    pub reference: String,
    pub amount: i64,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub plan: Option<PlanPayload>,
    pub customer: CustomerPayload,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub paid_at: Option<OffsetDateTime>,
}

impl ChargePayload {
    /// A charge belongs to a subscription when it carries a real plan code.
    /// The gateway sends an empty plan object for one-time purchases.
    pub fn plan_code(&self) -> Option<&str> {
        self.plan
            .as_ref()
            .and_then(|p| p.plan_code.as_deref())
            .filter(|c| !c.is_empty())
    }
}

/// `invoice.*` payloads: billing attempts under a subscription.
#[derive(Debug, Clone, Deserialize)]
pub struct InvoicePayload {
    pub invoice_code: String,
    pub amount: i64,
    #[serde(default)]
    pub paid: Option<bool>,
    #[serde(default)]
    pub status: Option<String>,
    pub subscription: SubscriptionRef,
    pub customer: CustomerPayload,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionRef {
    pub subscription_code: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub next_payment_date: Option<OffsetDateTime>,
}

/// `transfer.success` / `transfer.failed` / `transfer.reversed`
#[derive(Debug, Clone, Deserialize)]
pub struct TransferPayload {
    pub reference: String,
    #[serde(default)]
    pub transfer_code: Option<String>,
    pub amount: i64,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}
