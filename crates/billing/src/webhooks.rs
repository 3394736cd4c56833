//! Gateway webhook handling
//!
//! Verifies the HMAC-SHA512 body signature, claims the event atomically for
//! idempotent processing, and routes it to the reconciler or the payout
//! writer. Gateways deliver at-least-once; the claim table is what turns
//! duplicate deliveries into no-ops.

use hmac::{Hmac, Mac};
use sha2::Sha512;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::email::BillingEmailService;
use crate::error::{BillingError, BillingResult};
use crate::events::{EventEnvelope, EventKind};
use crate::payouts::PayoutService;
use crate::subscriptions::SubscriptionReconciler;

type HmacSha512 = Hmac<Sha512>;

/// Events stuck in 'processing' beyond this are considered abandoned by a
/// crashed worker and may be re-claimed.
const PROCESSING_TIMEOUT_MINUTES: i32 = 30;

pub struct WebhookHandler {
    pool: PgPool,
    secret: String,
    reconciler: SubscriptionReconciler,
    payouts: PayoutService,
    email: BillingEmailService,
}

impl WebhookHandler {
    pub fn new(
        pool: PgPool,
        secret: String,
        reconciler: SubscriptionReconciler,
        payouts: PayoutService,
        email: BillingEmailService,
    ) -> Self {
        Self {
            pool,
            secret,
            reconciler,
            payouts,
            email,
        }
    }

    /// Verify the hex HMAC-SHA512 of the raw body against the signature
    /// header. On mismatch nothing is parsed and nothing is written.
    pub fn verify_signature(&self, payload: &[u8], signature: &str) -> BillingResult<()> {
        let mut mac = HmacSha512::new_from_slice(self.secret.as_bytes()).map_err(|_| {
            tracing::error!("Webhook secret unusable as HMAC key");
            BillingError::InvalidSignature
        })?;
        mac.update(payload);
        let computed = hex::encode(mac.finalize().into_bytes());

        if !computed.eq_ignore_ascii_case(signature) {
            tracing::warn!(
                payload_len = payload.len(),
                "Webhook signature mismatch"
            );
            return Err(BillingError::InvalidSignature);
        }
        Ok(())
    }

    /// Full inbound pipeline: verify, parse, claim, dispatch, record.
    pub async fn handle(&self, raw_body: &[u8], signature: Option<&str>) -> BillingResult<()> {
        let signature = signature.ok_or(BillingError::InvalidSignature)?;
        self.verify_signature(raw_body, signature)?;

        let envelope = EventEnvelope::parse(raw_body)?;
        let event_id = envelope.event_id(raw_body);

        if !self.claim_event(&event_id, &envelope.event).await? {
            tracing::info!(
                event_id = %event_id,
                event_type = %envelope.event,
                "Duplicate webhook event, skipping"
            );
            return Ok(());
        }

        tracing::info!(
            event_id = %event_id,
            event_type = %envelope.event,
            "Processing webhook event"
        );

        let result = self.dispatch(&envelope).await;
        self.record_result(&event_id, &result).await;

        if let Err(e) = &result {
            if e.is_acknowledgeable() {
                tracing::warn!(
                    event_id = %event_id,
                    event_type = %envelope.event,
                    error = %e,
                    "Webhook event dropped as a no-op"
                );
            } else {
                tracing::error!(
                    event_id = %event_id,
                    event_type = %envelope.event,
                    error = %e,
                    "Webhook event processing failed"
                );
            }
        }
        result
    }

    /// Atomically claim exclusive processing rights for an event id.
    ///
    /// INSERT...ON CONFLICT...RETURNING ensures only one concurrent request
    /// wins the claim. Re-claimable: events that previously failed with a
    /// transient error (the gateway redelivers them) and events stuck in
    /// 'processing' past the timeout.
    async fn claim_event(&self, event_id: &str, event_type: &str) -> BillingResult<bool> {
        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO gateway_webhook_events
                (gateway_event_id, event_type, event_timestamp, processing_result, processing_started_at)
            VALUES ($1, $2, $3, 'processing', NOW())
            ON CONFLICT (gateway_event_id) DO UPDATE SET
                processing_result = 'processing',
                processing_started_at = NOW(),
                error_message = NULL
            WHERE gateway_webhook_events.processing_result = 'error'
               OR (gateway_webhook_events.processing_result = 'processing'
                   AND gateway_webhook_events.processing_started_at
                       < NOW() - make_interval(mins => $4::int))
            RETURNING id
            "#,
        )
        .bind(event_id)
        .bind(event_type)
        .bind(OffsetDateTime::now_utc())
        .bind(PROCESSING_TIMEOUT_MINUTES)
        .fetch_optional(&self.pool)
        .await?;

        Ok(claimed.is_some())
    }

    async fn dispatch(&self, envelope: &EventEnvelope) -> BillingResult<()> {
        match envelope.kind() {
            EventKind::SubscriptionCreate => {
                self.reconciler
                    .handle_subscription_create(&envelope.subscription()?)
                    .await
            }
            EventKind::SubscriptionNotRenew => {
                self.reconciler.handle_not_renew(&envelope.subscription()?).await
            }
            EventKind::SubscriptionDisable => {
                self.reconciler.handle_disable(&envelope.subscription()?).await
            }
            EventKind::ChargeSuccess => {
                self.reconciler.handle_charge_success(&envelope.charge()?).await
            }
            EventKind::InvoiceCreate => {
                self.reconciler.handle_invoice_created(&envelope.invoice()?).await
            }
            EventKind::InvoiceUpdate => {
                let invoice = envelope.invoice()?;
                if invoice.paid == Some(true) {
                    self.reconciler.handle_renewal_paid(&invoice).await
                } else {
                    self.reconciler.handle_invoice_created(&invoice).await
                }
            }
            EventKind::InvoicePaymentFailed => {
                let invoice = envelope.invoice()?;
                self.reconciler.handle_payment_failed(&invoice).await?;

                // Lifecycle email is fire-and-forget; failure is logged
                // inside the email service and never fails the webhook.
                let email = self.email.clone();
                let recipient = invoice.customer.email.clone();
                let amount = invoice.amount;
                tokio::spawn(async move {
                    email.send_payment_failed(&recipient, amount).await;
                });
                Ok(())
            }
            EventKind::TransferSuccess => {
                self.payouts.handle_transfer_success(&envelope.transfer()?).await
            }
            EventKind::TransferFailed => {
                self.payouts.handle_transfer_failed(&envelope.transfer()?).await
            }
            EventKind::TransferReversed => {
                self.payouts.handle_transfer_reversed(&envelope.transfer()?).await
            }
            EventKind::Unknown => {
                // Track which events arrive without a handler so new gateway
                // event types get noticed.
                tracing::info!(
                    event_type = %envelope.event,
                    "Received unhandled gateway event type"
                );
                Ok(())
            }
        }
    }

    /// Persist the processing outcome on the claim row. 'skipped' marks
    /// events that can never succeed (malformed, conflicting) so redelivery
    /// does not reprocess them; 'error' marks transient failures that a
    /// redelivery should retry.
    async fn record_result(&self, event_id: &str, result: &BillingResult<()>) {
        let (processing_result, error_message) = match result {
            Ok(()) => ("success", None),
            Err(e) if e.is_acknowledgeable() => ("skipped", Some(e.to_string())),
            Err(e) => ("error", Some(e.to_string())),
        };

        // Retry once; the audit row is what idempotency rests on.
        for attempt in 0..2 {
            match sqlx::query(
                r#"
                UPDATE gateway_webhook_events
                SET processing_result = $1, error_message = $2
                WHERE gateway_event_id = $3
                "#,
            )
            .bind(processing_result)
            .bind(&error_message)
            .bind(event_id)
            .execute(&self.pool)
            .await
            {
                Ok(_) => return,
                Err(e) if attempt == 0 => {
                    tracing::warn!(
                        event_id = %event_id,
                        error = %e,
                        "Failed to update webhook audit record, retrying"
                    );
                }
                Err(e) => {
                    tracing::error!(
                        event_id = %event_id,
                        processing_result = processing_result,
                        error = %e,
                        "Failed to update webhook audit record after retry; \
                         event may appear stuck in 'processing'"
                    );
                }
            }
        }
    }
}

/// Drop processed webhook events older than the retention window.
pub async fn cleanup_old_events(pool: &PgPool, retention_days: i64) -> BillingResult<u64> {
    let result = sqlx::query(
        r#"
        DELETE FROM gateway_webhook_events
        WHERE created_at < NOW() - make_interval(days => $1::int)
        "#,
    )
    .bind(retention_days)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}
