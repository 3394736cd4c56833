//! Payout lifecycle
//!
//! A payout is created pending when a withdrawal is requested and moved to a
//! terminal state (completed or failed) by transfer webhooks. A reversal is
//! a distinct notification but lands on the same terminal `failed` state.

use sqlx::{PgPool, Postgres, Transaction};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::client::GatewayClient;
use crate::error::{BillingError, BillingResult};
use crate::events::TransferPayload;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayoutStatus {
    Pending,
    Completed,
    Failed,
}

impl PayoutStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PayoutStatus::Pending => "pending",
            PayoutStatus::Completed => "completed",
            PayoutStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(PayoutStatus::Pending),
            "completed" => Some(PayoutStatus::Completed),
            "failed" => Some(PayoutStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Payout {
    pub id: Uuid,
    pub account_id: Uuid,
    pub reference: String,
    pub gateway_transfer_code: Option<String>,
    pub amount_minor: i64,
    pub status: String,
    pub created_at: OffsetDateTime,
}

#[derive(Clone)]
pub struct PayoutService {
    gateway: GatewayClient,
    pool: PgPool,
}

impl PayoutService {
    pub fn new(gateway: GatewayClient, pool: PgPool) -> Self {
        Self { gateway, pool }
    }

    /// Request a withdrawal: record the payout as pending, then initiate the
    /// transfer at the gateway. The gateway call is never auto-retried; a
    /// failed initiation marks the payout failed immediately.
    pub async fn request(
        &self,
        account_id: Uuid,
        recipient_code: &str,
        amount_minor: i64,
        reference: &str,
    ) -> BillingResult<Payout> {
        if amount_minor <= 0 {
            return Err(BillingError::malformed("non-positive payout amount"));
        }

        sqlx::query(
            r#"
            INSERT INTO payouts (account_id, reference, amount_minor, status)
            VALUES ($1, $2, $3, 'pending')
            "#,
        )
        .bind(account_id)
        .bind(reference)
        .bind(amount_minor)
        .execute(&self.pool)
        .await?;

        match self
            .gateway
            .initiate_transfer(recipient_code, amount_minor, reference, "Marketplace payout")
            .await
        {
            Ok(handle) => {
                sqlx::query(
                    r#"
                    UPDATE payouts
                    SET gateway_transfer_code = $1, updated_at = NOW()
                    WHERE reference = $2
                    "#,
                )
                .bind(&handle.transfer_code)
                .bind(reference)
                .execute(&self.pool)
                .await?;
            }
            Err(e) => {
                tracing::error!(
                    reference = reference,
                    error = %e,
                    "Transfer initiation failed, marking payout failed"
                );
                sqlx::query(
                    r#"
                    UPDATE payouts
                    SET status = 'failed', failure_reason = $1, updated_at = NOW()
                    WHERE reference = $2 AND status = 'pending'
                    "#,
                )
                .bind(e.to_string())
                .bind(reference)
                .execute(&self.pool)
                .await?;
                return Err(e);
            }
        }

        self.fetch_by_reference(reference).await
    }

    /// `transfer.success` webhook: pending -> completed.
    pub async fn handle_transfer_success(&self, payload: &TransferPayload) -> BillingResult<()> {
        self.settle(payload, PayoutStatus::Completed, None).await
    }

    /// `transfer.failed` webhook: pending -> failed.
    pub async fn handle_transfer_failed(&self, payload: &TransferPayload) -> BillingResult<()> {
        let reason = payload
            .reason
            .clone()
            .unwrap_or_else(|| "transfer failed at gateway".to_string());
        self.settle(payload, PayoutStatus::Failed, Some(reason)).await
    }

    /// `transfer.reversed` webhook: a compensating event after success is
    /// the only sanctioned way back out of `completed`, and it lands on
    /// `failed`.
    pub async fn handle_transfer_reversed(&self, payload: &TransferPayload) -> BillingResult<()> {
        let mut tx = self.pool.begin().await?;
        let payout = self.lock_by_reference(&mut tx, &payload.reference).await?;

        sqlx::query(
            r#"
            UPDATE payouts
            SET status = 'failed', failure_reason = 'reversed by gateway', updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(payout.id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        tracing::warn!(
            reference = %payload.reference,
            payout_id = %payout.id,
            "Payout reversed by gateway"
        );
        Ok(())
    }

    async fn settle(
        &self,
        payload: &TransferPayload,
        target: PayoutStatus,
        failure_reason: Option<String>,
    ) -> BillingResult<()> {
        let mut tx = self.pool.begin().await?;
        let payout = self.lock_by_reference(&mut tx, &payload.reference).await?;

        let current = PayoutStatus::parse(&payout.status)
            .ok_or_else(|| BillingError::Database(format!("bad payout status '{}'", payout.status)))?;

        match current {
            PayoutStatus::Pending => {}
            // Same terminal state again: duplicate delivery, no-op.
            s if s == target => {
                tx.commit().await?;
                return Ok(());
            }
            s => {
                return Err(BillingError::conflict(format!(
                    "payout '{}' is '{}', cannot move to '{}'",
                    payload.reference,
                    s.as_str(),
                    target.as_str()
                )));
            }
        }

        sqlx::query(
            r#"
            UPDATE payouts
            SET status = $1,
                failure_reason = $2,
                gateway_transfer_code = COALESCE(gateway_transfer_code, $3),
                updated_at = NOW()
            WHERE id = $4
            "#,
        )
        .bind(target.as_str())
        .bind(failure_reason)
        .bind(&payload.transfer_code)
        .bind(payout.id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        tracing::info!(
            reference = %payload.reference,
            status = target.as_str(),
            amount = payload.amount,
            "Payout settled"
        );
        Ok(())
    }

    async fn lock_by_reference(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        reference: &str,
    ) -> BillingResult<Payout> {
        let payout: Option<Payout> = sqlx::query_as(
            r#"
            SELECT id, account_id, reference, gateway_transfer_code, amount_minor, status, created_at
            FROM payouts
            WHERE reference = $1
            FOR UPDATE
            "#,
        )
        .bind(reference)
        .fetch_optional(&mut **tx)
        .await?;

        payout.ok_or_else(|| {
            BillingError::conflict(format!("transfer webhook for unknown payout '{reference}'"))
        })
    }

    async fn fetch_by_reference(&self, reference: &str) -> BillingResult<Payout> {
        let payout: Option<Payout> = sqlx::query_as(
            r#"
            SELECT id, account_id, reference, gateway_transfer_code, amount_minor, status, created_at
            FROM payouts
            WHERE reference = $1
            "#,
        )
        .bind(reference)
        .fetch_optional(&self.pool)
        .await?;

        payout.ok_or_else(|| BillingError::Database(format!("payout '{reference}' vanished")))
    }
}
