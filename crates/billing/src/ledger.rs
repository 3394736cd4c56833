//! Revenue ledger
//!
//! Append-only record of monetizable events used for reporting and
//! reconciliation. Rows are write-once; only the status may move, and only
//! monotonically PENDING -> {COMPLETED, FAILED}. The `(activity, reference)`
//! uniqueness makes duplicate appends (e.g. a renewal surfacing as both a
//! charge and an invoice event) a no-op.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerActivity {
    Subscription,
    SubscriptionRenew,
    Purchase,
}

impl LedgerActivity {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerActivity::Subscription => "SUBSCRIPTION",
            LedgerActivity::SubscriptionRenew => "SUBSCRIPTION_RENEW",
            LedgerActivity::Purchase => "PURCHASE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerStatus {
    Pending,
    Completed,
    Failed,
}

impl LedgerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerStatus::Pending => "PENDING",
            LedgerStatus::Completed => "COMPLETED",
            LedgerStatus::Failed => "FAILED",
        }
    }
}

/// A ledger row as stored.
#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub account_id: Uuid,
    pub activity: String,
    pub status: String,
    pub amount_minor: i64,
    pub reference: String,
    pub created_at: OffsetDateTime,
}

/// Amounts are stored in minor currency units; conversion to major units is
/// display-only. Integer arithmetic, exact over the whole i64 range.
pub fn format_major(amount_minor: i64) -> String {
    let sign = if amount_minor < 0 { "-" } else { "" };
    let abs = amount_minor.unsigned_abs();
    format!("{sign}{}.{:02}", abs / 100, abs % 100)
}

#[derive(Clone)]
pub struct RevenueLedger {
    pool: PgPool,
}

impl RevenueLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Append an entry. Returns false when an entry with the same
    /// `(activity, reference)` already exists.
    pub async fn append(
        &self,
        account_id: Uuid,
        activity: LedgerActivity,
        status: LedgerStatus,
        amount_minor: i64,
        reference: &str,
    ) -> BillingResult<bool> {
        Self::append_with(&self.pool, account_id, activity, status, amount_minor, reference).await
    }

    /// Append inside a caller-owned transaction.
    pub async fn append_with<'e, E>(
        exec: E,
        account_id: Uuid,
        activity: LedgerActivity,
        status: LedgerStatus,
        amount_minor: i64,
        reference: &str,
    ) -> BillingResult<bool>
    where
        E: sqlx::Executor<'e, Database = sqlx::Postgres>,
    {
        let result = sqlx::query(
            r#"
            INSERT INTO revenues (account_id, activity, status, amount_minor, reference)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (activity, reference) DO NOTHING
            "#,
        )
        .bind(account_id)
        .bind(activity.as_str())
        .bind(status.as_str())
        .bind(amount_minor)
        .bind(reference)
        .execute(exec)
        .await?;

        let inserted = result.rows_affected() > 0;
        if !inserted {
            tracing::info!(
                activity = activity.as_str(),
                reference = reference,
                "Duplicate ledger append skipped"
            );
        }
        Ok(inserted)
    }

    /// Move a PENDING entry to a terminal status. The WHERE clause enforces
    /// monotonicity: there is no SQL path back to PENDING or across
    /// terminal states. Returns false when nothing was pending.
    pub async fn mark_status(
        &self,
        activity: LedgerActivity,
        reference: &str,
        status: LedgerStatus,
    ) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE revenues
            SET status = $1, updated_at = NOW()
            WHERE activity = $2 AND reference = $3 AND status = 'PENDING'
            "#,
        )
        .bind(status.as_str())
        .bind(activity.as_str())
        .bind(reference)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Completed revenue for one account, for reporting.
    pub async fn completed_total_minor(&self, account_id: Uuid) -> BillingResult<i64> {
        let total: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT SUM(amount_minor)::BIGINT
            FROM revenues
            WHERE account_id = $1 AND status = 'COMPLETED'
            "#,
        )
        .bind(account_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(total.unwrap_or(0))
    }

    pub async fn entries_for_account(&self, account_id: Uuid) -> BillingResult<Vec<LedgerEntry>> {
        let entries = sqlx::query_as(
            r#"
            SELECT id, account_id, activity, status, amount_minor, reference, created_at
            FROM revenues
            WHERE account_id = $1
            ORDER BY created_at DESC
            "#,
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(entries)
    }
}
